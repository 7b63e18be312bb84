//! The per-response byte pipeline.
//!
//! A [`Pipeline`] chains `decompressor -> stage_1 .. stage_N -> compressor`. Every
//! chunk written goes through the whole chain before the next one is accepted, so the
//! bytes leaving the compressor keep the order they were written in. Finishing walks the
//! chain front to back: a stage is only told its input is complete after every stage
//! before it has flushed its tail into it.

use crate::codec::{CodecPair, ContentCoding};
use crate::error::StageError;
use crate::stage::{Stage, StageOutput};
use crate::utils::ensure;
use bytes::Bytes;
use std::fmt;
use std::iter;
use tracing::trace;

pub struct Pipeline {
    decompressor: Box<dyn Stage>,
    stages: Vec<Box<dyn Stage>>,
    compressor: Box<dyn Stage>,
    coding: ContentCoding,
    finished: bool,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("coding", &self.coding)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wires `decompressor`, the stages in order, and `compressor` into one chain.
    ///
    /// With no stages the decompressor feeds the compressor directly.
    pub fn assemble(decompressor: Box<dyn Stage>, stages: Vec<Box<dyn Stage>>, compressor: Box<dyn Stage>) -> Self {
        Self { decompressor, stages, compressor, coding: ContentCoding::Identity, finished: false }
    }

    /// Assembles the chain between the two halves of a codec pair.
    pub fn with_codec(codec: CodecPair, stages: Vec<Box<dyn Stage>>) -> Self {
        let coding = codec.coding;
        Self { coding, ..Self::assemble(codec.decompressor, stages, codec.compressor) }
    }

    /// Number of caller stages between the codecs.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn coding(&self) -> ContentCoding {
        self.coding
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn chain_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Stage>> {
        iter::once(&mut self.decompressor).chain(self.stages.iter_mut()).chain(iter::once(&mut self.compressor))
    }

    /// Pushes one chunk through the chain, returning what the compressor emitted.
    pub fn write(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, StageError> {
        ensure!(!self.finished, StageError::transform("pipeline has already finished"));

        let mut pending = vec![chunk];
        for stage in self.chain_mut() {
            if pending.is_empty() {
                break;
            }
            let mut out = StageOutput::new();
            for chunk in pending {
                stage.transform(chunk, &mut out)?;
            }
            pending = out.into_chunks();
        }

        trace!(chunks = pending.len(), "pipeline emitted");
        Ok(pending)
    }

    /// Completes every stage in order, returning the compressor's remaining output.
    pub fn finish(&mut self) -> Result<Vec<Bytes>, StageError> {
        ensure!(!self.finished, StageError::transform("pipeline has already finished"));
        self.finished = true;

        let mut pending = Vec::new();
        for stage in self.chain_mut() {
            let mut out = StageOutput::new();
            for chunk in pending {
                stage.transform(chunk, &mut out)?;
            }
            stage.finish(&mut out)?;
            pending = out.into_chunks();
        }

        Ok(pending)
    }
}
