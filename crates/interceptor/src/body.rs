//! A response body driven through the interception pipeline as it is polled.
//!
//! This is the pull-style counterpart of [`InterceptedResponse`](crate::InterceptedResponse),
//! for hosts which hand out a complete `http::Response<B>` and let the transport poll
//! its body, like a hyper based reverse proxy does.

use crate::error::{InterceptError, SendError};
use crate::pipeline::Pipeline;
use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tracing::error;

pin_project! {
    /// A body whose data frames go through a [`Pipeline`] before being yielded.
    ///
    /// Without a pipeline the inner frames are passed on unchanged.
    pub struct InterceptBody<B> {
        #[pin]
        inner: B,
        pipeline: Option<Pipeline>,
        buffered: VecDeque<Bytes>,
        trailers: Option<HeaderMap>,
        done: bool,
    }
}

impl<B> InterceptBody<B> {
    pub(crate) fn new(inner: B, pipeline: Option<Pipeline>) -> Self {
        Self { inner, pipeline, buffered: VecDeque::new(), trailers: None, done: false }
    }

    /// Returns true if the body goes through a pipeline.
    pub fn is_intercepting(&self) -> bool {
        self.pipeline.is_some()
    }
}

impl<B> std::fmt::Debug for InterceptBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptBody")
            .field("pipeline", &self.pipeline)
            .field("buffered", &self.buffered.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<B> Body for InterceptBody<B>
where
    B: Body,
    B::Error: Display,
{
    type Data = Bytes;
    type Error = InterceptError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            if let Some(bytes) = this.buffered.pop_front() {
                return Poll::Ready(Some(Ok(Frame::data(bytes))));
            }

            if *this.done {
                return Poll::Ready(this.trailers.take().map(|trailers| Ok(Frame::trailers(trailers))));
            }

            let Some(pipeline) = this.pipeline.as_mut() else {
                // nothing to transform, just adapt the frame type
                return match ready!(this.inner.as_mut().poll_frame(cx)) {
                    Some(Ok(frame)) => Poll::Ready(Some(Ok(frame.map_data(|mut data| data.copy_to_bytes(data.remaining()))))),
                    Some(Err(e)) => {
                        *this.done = true;
                        Poll::Ready(Some(Err(SendError::invalid_body(e.to_string()).into())))
                    }
                    None => {
                        *this.done = true;
                        Poll::Ready(None)
                    }
                };
            };

            let result = match ready!(this.inner.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(mut data) => pipeline.write(data.copy_to_bytes(data.remaining())),
                    Err(frame) => {
                        // trailers end the data, the pipeline is flushed before they are sent
                        *this.trailers = frame.into_trailers().ok();
                        *this.done = true;
                        pipeline.finish()
                    }
                },
                Some(Err(e)) => {
                    error!(cause = %e, "inner body failed while intercepting");
                    *this.done = true;
                    return Poll::Ready(Some(Err(SendError::invalid_body(e.to_string()).into())));
                }
                None => {
                    *this.done = true;
                    pipeline.finish()
                }
            };

            match result {
                Ok(chunks) => this.buffered.extend(chunks),
                Err(e) => {
                    error!(cause = %e, "interception pipeline failed");
                    *this.done = true;
                    this.trailers.take();
                    return Poll::Ready(Some(Err(e.into())));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        if self.pipeline.is_none() {
            return self.done || self.inner.is_end_stream();
        }
        self.done && self.buffered.is_empty() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.pipeline {
            None => self.inner.size_hint(),
            // the transformed length is unknown
            Some(_) => SizeHint::default(),
        }
    }
}
