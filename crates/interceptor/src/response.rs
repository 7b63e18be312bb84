//! The outbound response abstraction interception is layered on.
//!
//! A host (an HTTP connection, a proxy's downstream writer, a test buffer) exposes its
//! response through [`ResponseWriter`]: committed header access plus the three
//! operations which move the response forward, writing the head, writing a body chunk
//! and ending the body. [`InterceptedResponse`](crate::InterceptedResponse) decorates
//! any `ResponseWriter` with the same capability set.

use crate::error::SendError;
use crate::utils::ensure;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, header};
use tracing::trace;

/// Type alias for the request a response answers, without its body.
pub type RequestHead = Request<()>;

/// Type alias for response headers before the body is attached.
pub type ResponseHead = Response<()>;

#[async_trait]
pub trait ResponseWriter: Send {
    /// The status written with an implicit head, if no head was written explicitly.
    fn status(&self) -> StatusCode;

    /// Headers already set on the response.
    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Returns true once the head has been handed to the transport.
    fn headers_sent(&self) -> bool;

    /// Writes the head. `headers` are merged over the committed headers.
    ///
    /// `reason` is a custom reason phrase; `None` sends the status' canonical one.
    async fn write_head(&mut self, status: StatusCode, reason: Option<&str>, headers: HeaderMap) -> Result<(), SendError>;

    /// Writes one body chunk, writing an implicit head first if needed.
    async fn write_body(&mut self, chunk: Bytes) -> Result<(), SendError>;

    /// Ends the body, optionally writing a last chunk.
    async fn end(&mut self, chunk: Option<Bytes>) -> Result<(), SendError>;
}

#[async_trait]
impl<W: ResponseWriter + ?Sized> ResponseWriter for Box<W> {
    fn status(&self) -> StatusCode {
        (**self).status()
    }

    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn headers_sent(&self) -> bool {
        (**self).headers_sent()
    }

    async fn write_head(&mut self, status: StatusCode, reason: Option<&str>, headers: HeaderMap) -> Result<(), SendError> {
        (**self).write_head(status, reason, headers).await
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), SendError> {
        (**self).write_body(chunk).await
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> Result<(), SendError> {
        (**self).end(chunk).await
    }
}

/// A response kept in memory.
///
/// The head is framed the way an HTTP/1.1 encoder frames it: without a
/// `content-length`, the body is sent with `transfer-encoding: chunked`.
#[derive(Debug, Default)]
pub struct MemoryResponse {
    status: StatusCode,
    headers: HeaderMap,
    head: Option<ResponseHead>,
    reason: Option<String>,
    chunks: Vec<Bytes>,
    ended: bool,
}

impl MemoryResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The head as it went to the wire, if it was written.
    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    /// The reason phrase sent with the head: the custom one if given, else the canonical one.
    pub fn reason(&self) -> Option<&str> {
        let head = self.head.as_ref()?;
        self.reason.as_deref().or_else(|| head.status().canonical_reason())
    }

    /// Body chunks in the order they were written.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.chunks.iter().map(Bytes::len).sum());
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn send_head(&mut self, status: StatusCode, reason: Option<&str>, headers: HeaderMap) -> Result<(), SendError> {
        ensure!(self.head.is_none(), SendError::HeadersSent);

        let mut merged = self.headers.clone();
        for name in headers.keys() {
            merged.remove(name);
        }
        for (name, value) in &headers {
            merged.append(name.clone(), value.clone());
        }

        if !merged.contains_key(header::CONTENT_LENGTH) && !merged.contains_key(header::TRANSFER_ENCODING) {
            merged.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }

        let mut head = ResponseHead::default();
        *head.status_mut() = status;
        *head.headers_mut() = merged;
        trace!(status = %status, "memory response head written");

        self.status = status;
        self.reason = reason.map(str::to_owned);
        self.head = Some(head);
        Ok(())
    }
}

#[async_trait]
impl ResponseWriter for MemoryResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn headers_sent(&self) -> bool {
        self.head.is_some()
    }

    async fn write_head(&mut self, status: StatusCode, reason: Option<&str>, headers: HeaderMap) -> Result<(), SendError> {
        self.send_head(status, reason, headers)
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), SendError> {
        ensure!(!self.ended, SendError::invalid_body("write after end"));
        if self.head.is_none() {
            self.send_head(self.status, None, HeaderMap::new())?;
        }

        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
        Ok(())
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> Result<(), SendError> {
        ensure!(!self.ended, SendError::invalid_body("response already ended"));
        match chunk {
            Some(chunk) => self.write_body(chunk).await?,
            None if self.head.is_none() => self.send_head(self.status, None, HeaderMap::new())?,
            None => {}
        }

        self.ended = true;
        Ok(())
    }
}
