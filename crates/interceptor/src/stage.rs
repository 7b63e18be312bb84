//! Byte transform stages.
//!
//! A [`Stage`] consumes chunks in order, emits chunks in order into a [`StageOutput`]
//! and is told once that its input is complete through [`Stage::finish`]. Stages are
//! created per response by a [`StageFactory`] and are owned by that response's
//! [`Pipeline`](crate::pipeline::Pipeline) until it ends; they are never shared between
//! responses.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use micro_intercept::stage::{stage_fn, Stage, StageOutput};
//!
//! let mut upper = stage_fn(|chunk: Bytes| Bytes::from(chunk.to_ascii_uppercase()));
//!
//! let mut out = StageOutput::new();
//! upper.transform(Bytes::from_static(b"foo"), &mut out).unwrap();
//! assert_eq!(out.into_chunks(), vec![Bytes::from_static(b"FOO")]);
//! ```

use crate::error::StageError;
use crate::{RequestHead, ResponseHead};
use bytes::Bytes;
use std::fmt;

/// An ordered byte transform.
pub trait Stage: Send {
    /// Consume one chunk, pushing any produced bytes into `out`.
    fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError>;

    /// Signal that no more input will arrive, flushing whatever is still buffered.
    fn finish(&mut self, _out: &mut StageOutput) -> Result<(), StageError> {
        Ok(())
    }
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError> {
        (**self).transform(chunk, out)
    }

    fn finish(&mut self, out: &mut StageOutput) -> Result<(), StageError> {
        (**self).finish(out)
    }
}

/// Ordered chunks emitted by a stage.
///
/// Empty chunks are dropped on push, so a stage may forward whatever it produced
/// without checking its length.
#[derive(Debug, Default)]
pub struct StageOutput {
    chunks: Vec<Bytes>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    #[inline]
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }
}

/// A stage which emits every chunk unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Stage for PassThrough {
    #[inline]
    fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError> {
        out.push(chunk);
        Ok(())
    }
}

/// A stage that maps every chunk through a closure.
#[derive(Clone, Copy)]
pub struct FnStage<F>(F);

impl<F> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").finish_non_exhaustive()
    }
}

impl<F> Stage for FnStage<F>
where
    F: FnMut(Bytes) -> Bytes + Send,
{
    fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError> {
        out.push((self.0)(chunk));
        Ok(())
    }
}

/// Creates a stage from a per-chunk closure.
pub fn stage_fn<F>(f: F) -> FnStage<F>
where
    F: FnMut(Bytes) -> Bytes + Send,
{
    FnStage(f)
}

/// Conversion into the ordered stages contributed by one registration.
///
/// A factory may return a single stage or a list of stages; both end up as a list, so
/// the pipeline never has to tell them apart.
pub trait IntoStages {
    fn into_stages(self) -> Vec<Box<dyn Stage>>;
}

impl<S: Stage + 'static> IntoStages for S {
    fn into_stages(self) -> Vec<Box<dyn Stage>> {
        vec![Box::new(self)]
    }
}

impl IntoStages for Vec<Box<dyn Stage>> {
    #[inline]
    fn into_stages(self) -> Vec<Box<dyn Stage>> {
        self
    }
}

/// Creates the stages for a single response.
///
/// Called at most once per response and registration, when the registration's filter
/// has matched. The [`ResponseHead`] holds the decided status and the merged header
/// set of the response.
pub trait StageFactory: Send + Sync {
    fn create(&self, req: &RequestHead, resp: &ResponseHead) -> Vec<Box<dyn Stage>>;
}

impl<F, S> StageFactory for F
where
    F: Fn(&RequestHead, &ResponseHead) -> S + Send + Sync,
    S: IntoStages,
{
    fn create(&self, req: &RequestHead, resp: &ResponseHead) -> Vec<Box<dyn Stage>> {
        (self)(req, resp).into_stages()
    }
}
