//! The decorator which puts a session in front of a [`ResponseWriter`].
//!
//! [`InterceptedResponse`] implements the same capability set as the response it wraps.
//! The first of `write_head`, `write_body` or `end` decides, once, whether the response
//! is intercepted:
//!
//! - **intercepting**: `content-length` is removed from the committed headers and from
//!   every head written afterwards, body chunks go into the pipeline and whatever leaves
//!   the compressor is written to the wrapped response, and `end` finishes the pipeline
//!   before ending the wrapped response.
//! - **passing through**: every call is forwarded unchanged.
//!
//! After the body ended (or the pipeline failed) the response is finalized and every
//! further call fails with [`SendError::Finalized`].

use crate::config::InterceptConfig;
use crate::error::SendError;
use crate::registry::Interceptor;
use crate::response::ResponseWriter;
use crate::session::{SessionState, decide, strip_content_length};
use crate::RequestHead;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use std::fmt;
use tracing::{debug, error, trace, warn};

pub struct InterceptedResponse<W> {
    inner: W,
    request: RequestHead,
    registrations: Vec<Interceptor>,
    config: InterceptConfig,
    state: SessionState,
}

impl<W: fmt::Debug> fmt::Debug for InterceptedResponse<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedResponse")
            .field("inner", &self.inner)
            .field("uri", self.request.uri())
            .field("registrations", &self.registrations.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<W: ResponseWriter> InterceptedResponse<W> {
    /// Creates the session for `inner`, answering `request`.
    pub fn new(request: RequestHead, inner: W) -> Self {
        Self::with_config(request, inner, InterceptConfig::default())
    }

    pub fn with_config(request: RequestHead, inner: W, config: InterceptConfig) -> Self {
        Self { inner, request, registrations: Vec::new(), config, state: SessionState::Idle }
    }

    /// Appends a registration to this response's session.
    ///
    /// Registrations attached after the decision was taken can no longer contribute
    /// stages and are ignored.
    pub fn attach(&mut self, interceptor: &Interceptor) -> &mut Self {
        if self.state.is_decided() {
            warn!(uri = %self.request.uri(), "registration attached after the interception decision, ignored");
            return self;
        }

        self.registrations.push(interceptor.clone());
        self
    }

    /// Returns true once the decision was taken and the body goes through a pipeline.
    pub fn is_intercepting(&self) -> bool {
        matches!(self.state, SessionState::Intercepting(_))
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, SessionState::Finalized | SessionState::Aborted)
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Stops the session without flushing the pipeline.
    ///
    /// Buffered bytes are dropped and every later call fails with
    /// [`SendError::Aborted`]. The wrapped response is left as it is.
    pub fn abort(&mut self) {
        if !self.is_finalized() {
            debug!(uri = %self.request.uri(), "interception aborted");
        }
        self.state = SessionState::Aborted;
    }

    fn ensure_open(&self) -> Result<(), SendError> {
        match self.state {
            SessionState::Finalized => {
                error!(uri = %self.request.uri(), "response used after it was finalized");
                Err(SendError::Finalized)
            }
            SessionState::Aborted => Err(SendError::Aborted),
            _ => Ok(()),
        }
    }

    /// Takes the interception decision if it hasn't been taken yet.
    fn decide_once(&mut self, status: StatusCode, pending: Option<&HeaderMap>) {
        if self.state.is_decided() {
            return;
        }

        // the length of a transformed body is unknown, a flushed content-length can't be undone
        if self.inner.headers_sent() && self.inner.headers().contains_key(header::CONTENT_LENGTH) {
            warn!(uri = %self.request.uri(), "headers already sent with content-length, passing through");
            self.state = SessionState::PassingThrough;
            return;
        }

        let pipeline =
            decide(&self.registrations, &self.request, status, self.inner.headers(), pending, &self.config);

        self.state = match pipeline {
            Some(pipeline) => {
                if !self.inner.headers_sent() && strip_content_length(self.inner.headers_mut()) {
                    trace!("removed committed content-length");
                }
                SessionState::Intercepting(pipeline)
            }
            None => SessionState::PassingThrough,
        };
    }

    /// Pushes `chunk` through the pipeline and forwards the output.
    async fn forward(&mut self, chunk: Bytes) -> Result<(), SendError> {
        let SessionState::Intercepting(pipeline) = &mut self.state else {
            return self.inner.write_body(chunk).await;
        };

        match pipeline.write(chunk) {
            Ok(chunks) => self.write_chunks(chunks).await,
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    async fn write_chunks(&mut self, chunks: Vec<Bytes>) -> Result<(), SendError> {
        for chunk in chunks {
            if let Err(e) = self.inner.write_body(chunk).await {
                error!(cause = %e, "failed to write intercepted chunk");
                self.state = SessionState::Finalized;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Finalizes the session after a pipeline error, ending the wrapped response with
    /// whatever was already written.
    async fn fail(&mut self, e: SendError) -> SendError {
        error!(uri = %self.request.uri(), cause = %e, "interception pipeline failed");
        self.state = SessionState::Finalized;

        if let Err(end_error) = self.inner.end(None).await {
            error!(cause = %end_error, "failed to end response after pipeline error");
        }
        e
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for InterceptedResponse<W> {
    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn headers_sent(&self) -> bool {
        self.inner.headers_sent()
    }

    async fn write_head(&mut self, status: StatusCode, reason: Option<&str>, mut headers: HeaderMap) -> Result<(), SendError> {
        self.ensure_open()?;
        self.decide_once(status, Some(&headers));

        if self.is_intercepting() && strip_content_length(&mut headers) {
            trace!("removed content-length from written head");
        }
        self.inner.write_head(status, reason, headers).await
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), SendError> {
        self.ensure_open()?;
        let status = self.inner.status();
        self.decide_once(status, None);

        self.forward(chunk).await
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> Result<(), SendError> {
        self.ensure_open()?;
        let status = self.inner.status();
        self.decide_once(status, None);

        let SessionState::Intercepting(_) = self.state else {
            self.state = SessionState::Finalized;
            return self.inner.end(chunk).await;
        };

        if let Some(chunk) = chunk {
            self.forward(chunk).await?;
        }

        // forward may have finalized the session on error
        let SessionState::Intercepting(pipeline) = &mut self.state else {
            return Err(SendError::Finalized);
        };

        let tail = match pipeline.finish() {
            Ok(tail) => tail,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        self.write_chunks(tail).await?;

        self.state = SessionState::Finalized;
        trace!(uri = %self.request.uri(), "intercepted response finalized");
        self.inner.end(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnknownEncoding;
    use crate::error::StageError;
    use crate::filter::Filter;
    use crate::response::MemoryResponse;
    use crate::stage::{PassThrough, Stage, StageOutput, stage_fn};
    use crate::ResponseHead;
    use flate2::Compression;
    use flate2::read::{GzDecoder, ZlibDecoder};
    use flate2::write::{GzEncoder, ZlibEncoder};
    use http::HeaderValue;
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::TRACE).try_init();
    }

    fn request(uri: &str) -> RequestHead {
        RequestHead::builder().uri(uri).body(()).unwrap()
    }

    fn suffix_stage(s: &'static [u8]) -> impl Stage {
        stage_fn(move |chunk: Bytes| {
            let mut buf = chunk.to_vec();
            buf.extend_from_slice(s);
            Bytes::from(buf)
        })
    }

    fn suffix(s: &'static [u8]) -> Interceptor {
        Interceptor::new(move |_req: &RequestHead, _resp: &ResponseHead| suffix_stage(s))
    }

    /// Counts how many responses created its stage.
    fn counting(filter: Filter, counter: Arc<AtomicUsize>) -> Interceptor {
        Interceptor::with_filter(filter, move |_req: &RequestHead, _resp: &ResponseHead| {
            counter.fetch_add(1, Ordering::SeqCst);
            PassThrough
        })
    }

    fn query_headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[tokio::test]
    async fn intercepts_without_filter() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut response = InterceptedResponse::new(request("/foo%20bar123?foo=bar"), MemoryResponse::new());
        response.attach(&counting(Filter::any(), counter.clone()));

        response.write_head(StatusCode::OK, None, HeaderMap::new()).await.unwrap();
        assert!(response.is_intercepting());
        response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(response.get_ref().body(), Bytes::from_static(b"foo"));
    }

    #[tokio::test]
    async fn filters_by_path() {
        let filter = Filter::builder().path(r"foo\s+bar\d+").unwrap().build();

        for (uri, intercepted) in [("/foo%20%20bar123", true), ("/", false)] {
            let counter = Arc::new(AtomicUsize::new(0));
            let mut response = InterceptedResponse::new(request(uri), MemoryResponse::new());
            response.attach(&counting(filter.clone(), counter.clone()));

            response.write_head(StatusCode::OK, None, HeaderMap::new()).await.unwrap();
            response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

            assert!(response.is_finalized());
            assert_eq!(counter.load(Ordering::SeqCst) == 1, intercepted, "uri {uri}");
        }
    }

    #[tokio::test]
    async fn filters_by_headers() {
        let filter = Filter::builder()
            .header("content-type", r"text/html")
            .unwrap()
            .header("content-encoding", r"^identity$")
            .unwrap()
            .header("foo", r"bar")
            .unwrap()
            .build();

        let cases = [
            (vec![("content-type", "text/html"), ("content-encoding", "identity"), ("foo", "bar")], true),
            (vec![("content-type", "text/css"), ("content-encoding", "identity"), ("foo", "bar")], false),
            (vec![("content-type", "text/css"), ("content-encoding", "identity"), ("foo", "foo")], false),
            (vec![("content-type", "text/html"), ("content-encoding", "identity")], false),
        ];

        for (pairs, intercepted) in cases {
            let counter = Arc::new(AtomicUsize::new(0));
            let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
            response.attach(&counting(filter.clone(), counter.clone()));

            response.write_head(StatusCode::OK, None, query_headers(&pairs)).await.unwrap();
            assert_eq!(response.is_intercepting(), intercepted, "headers {pairs:?}");
            response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

            assert_eq!(counter.load(Ordering::SeqCst) == 1, intercepted);
            assert_eq!(response.get_ref().body(), Bytes::from_static(b"foo"));
        }
    }

    #[tokio::test]
    async fn transforms_every_chunk() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&suffix(b"bar"));

        response.write_body(Bytes::from_static(b"foo")).await.unwrap();
        response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

        let inner = response.get_ref();
        assert_eq!(inner.chunks(), &[Bytes::from_static(b"foobar"), Bytes::from_static(b"foobar")]);
        assert_eq!(inner.body(), Bytes::from_static(b"foobarfoobar"));
        assert!(inner.is_ended());
    }

    #[tokio::test]
    async fn chains_stages_of_one_factory() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&Interceptor::new(|_req: &RequestHead, _resp: &ResponseHead| -> Vec<Box<dyn Stage>> {
            vec![Box::new(suffix_stage(b"bar")), Box::new(suffix_stage(b"baz"))]
        }));

        response.write_body(Bytes::from_static(b"foo")).await.unwrap();
        response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

        assert_eq!(response.get_ref().body(), Bytes::from_static(b"foobarbazfoobarbaz"));
    }

    #[tokio::test]
    async fn chains_stages_of_separate_registrations() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&suffix(b"bar")).attach(&suffix(b"baz"));

        response.write_body(Bytes::from_static(b"foo")).await.unwrap();
        response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

        assert_eq!(response.get_ref().body(), Bytes::from_static(b"foobarbazfoobarbaz"));
    }

    #[tokio::test]
    async fn removes_content_length() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&Interceptor::new(|_req: &RequestHead, _resp: &ResponseHead| PassThrough));
        response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from_static("6"));

        let mut headers = HeaderMap::new();
        headers.append(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        headers.append(http::HeaderName::from_bytes(b"ContenT-lEnGth").unwrap(), HeaderValue::from_static("6"));
        response.write_head(StatusCode::OK, None, headers).await.unwrap();
        response.write_body(Bytes::from_static(b"foo")).await.unwrap();
        response.end(Some(Bytes::from_static(b"bar"))).await.unwrap();

        let inner = response.get_ref();
        let head = inner.head().unwrap();
        assert!(!head.headers().contains_key(header::CONTENT_LENGTH));
        assert_eq!(head.headers()[header::TRANSFER_ENCODING], "chunked");
        assert_eq!(inner.body(), Bytes::from_static(b"foobar"));
    }

    #[tokio::test]
    async fn keeps_custom_reason_phrase() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&suffix(b"bar"));

        response.write_head(StatusCode::NOT_FOUND, Some("Gone Fishing"), HeaderMap::new()).await.unwrap();
        assert!(response.is_intercepting());
        response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

        let inner = response.get_ref();
        assert_eq!(inner.head().unwrap().status(), StatusCode::NOT_FOUND);
        assert_eq!(inner.reason(), Some("Gone Fishing"));
        assert_eq!(inner.body(), Bytes::from_static(b"foobar"));
    }

    #[tokio::test]
    async fn pass_through_keeps_content_length() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&Interceptor::with_filter(
            Filter::builder().path("^/only-here$").unwrap().build(),
            |_req: &RequestHead, _resp: &ResponseHead| PassThrough,
        ));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        response.write_head(StatusCode::OK, None, headers).await.unwrap();
        assert!(!response.is_intercepting());
        response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

        let head = response.get_ref().head().unwrap();
        assert_eq!(head.headers()[header::CONTENT_LENGTH], "3");
    }

    #[tokio::test]
    async fn decides_only_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&counting(Filter::any(), counter.clone()));

        response.write_head(StatusCode::OK, None, HeaderMap::new()).await.unwrap();
        response.write_body(Bytes::from_static(b"a")).await.unwrap();
        response.write_body(Bytes::from_static(b"b")).await.unwrap();
        response.end(None).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(response.get_ref().body(), Bytes::from_static(b"ab"));
    }

    #[tokio::test]
    async fn gzip_round_trip() {
        let mut upstream = GzEncoder::new(Vec::new(), Compression::default());
        upstream.write_all(b"foobar").unwrap();
        let compressed = upstream.finish().unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = seen.clone();
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&Interceptor::new(move |_req: &RequestHead, _resp: &ResponseHead| {
            let record = record.clone();
            stage_fn(move |chunk: Bytes| {
                record.lock().unwrap().extend_from_slice(&chunk);
                chunk
            })
        }));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        response.write_head(StatusCode::OK, None, headers).await.unwrap();
        for chunk in compressed.chunks(7) {
            response.write_body(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        response.end(None).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), b"foobar");

        let inner = response.get_ref();
        assert_eq!(inner.head().unwrap().headers()[header::CONTENT_ENCODING], "gzip");

        let body = inner.body();
        let mut plain = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "foobar");
    }

    #[tokio::test]
    async fn deflate_transformed_round_trip() {
        /// Appends its suffix once the body is complete.
        struct Trailer(&'static [u8]);
        impl Stage for Trailer {
            fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError> {
                out.push(chunk);
                Ok(())
            }

            fn finish(&mut self, out: &mut StageOutput) -> Result<(), StageError> {
                out.push(Bytes::from_static(self.0));
                Ok(())
            }
        }

        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&Interceptor::new(|_req: &RequestHead, _resp: &ResponseHead| Trailer(b"bar")));
        response.headers_mut().insert(header::CONTENT_ENCODING, HeaderValue::from_static("Deflate"));

        let mut upstream = ZlibEncoder::new(Vec::new(), Compression::default());
        upstream.write_all(b"foobar").unwrap();
        let compressed = upstream.finish().unwrap();
        let (head, tail) = compressed.split_at(compressed.len() / 2);

        response.write_head(StatusCode::OK, None, HeaderMap::new()).await.unwrap();
        response.write_body(Bytes::copy_from_slice(head)).await.unwrap();
        response.end(Some(Bytes::copy_from_slice(tail))).await.unwrap();

        let inner = response.get_ref();
        assert_eq!(inner.head().unwrap().headers()[header::CONTENT_ENCODING], "Deflate");

        let body = inner.body();
        let mut plain = String::new();
        ZlibDecoder::new(&body[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "foobarbar");
    }

    #[tokio::test]
    async fn malformed_upstream_ends_with_error() {
        init_tracing();
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&suffix(b"bar"));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        response.write_head(StatusCode::OK, None, headers).await.unwrap();

        let write = response.write_body(Bytes::from_static(b"definitely not gzip data")).await;
        let end = response.end(None).await;

        assert!(write.is_err() || end.is_err());
        assert!(response.is_finalized());
        assert!(response.get_ref().is_ended());
    }

    async fn send_truncated(
        content_encoding: &'static str,
        compressed: Vec<u8>,
    ) -> (InterceptedResponse<MemoryResponse>, Result<(), SendError>) {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&Interceptor::new(|_req: &RequestHead, _resp: &ResponseHead| PassThrough));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(content_encoding));
        response.write_head(StatusCode::OK, None, headers).await.unwrap();

        let truncated = Bytes::copy_from_slice(&compressed[..compressed.len() / 2]);
        response.write_body(truncated).await.unwrap();
        let end = response.end(None).await;
        (response, end)
    }

    #[tokio::test]
    async fn truncated_deflate_upstream_ends_with_error() {
        init_tracing();
        let mut upstream = ZlibEncoder::new(Vec::new(), Compression::default());
        upstream.write_all(b"foobarfoobarfoobar hello world").unwrap();

        let (response, end) = send_truncated("deflate", upstream.finish().unwrap()).await;
        assert!(matches!(end, Err(SendError::Stage { source: StageError::Io { .. } })));
        assert!(response.is_finalized());
        assert!(response.get_ref().is_ended());
    }

    #[tokio::test]
    async fn truncated_gzip_upstream_ends_with_error() {
        init_tracing();
        let mut upstream = GzEncoder::new(Vec::new(), Compression::default());
        upstream.write_all(b"foobarfoobarfoobar hello world").unwrap();

        let (response, end) = send_truncated("gzip", upstream.finish().unwrap()).await;
        assert!(matches!(end, Err(SendError::Stage { .. })));
        assert!(response.is_finalized());
        assert!(response.get_ref().is_ended());
    }

    #[tokio::test]
    async fn unrecognized_encoding_is_transformed_raw() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&suffix(b"bar"));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("br"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        response.write_head(StatusCode::OK, None, headers).await.unwrap();
        assert!(response.is_intercepting());
        response.end(Some(Bytes::from_static(b"abc"))).await.unwrap();

        let inner = response.get_ref();
        let head = inner.head().unwrap();
        assert!(!head.headers().contains_key(header::CONTENT_LENGTH));
        assert_eq!(head.headers()[header::CONTENT_ENCODING], "br");
        assert_eq!(inner.body(), Bytes::from_static(b"abcbar"));
    }

    #[tokio::test]
    async fn unrecognized_encoding_passes_through_when_configured() {
        let config = InterceptConfig::new().with_unknown_encoding(UnknownEncoding::PassThrough);
        let mut response = InterceptedResponse::with_config(request("/"), MemoryResponse::new(), config);
        response.attach(&suffix(b"bar"));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("br"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        response.write_head(StatusCode::OK, None, headers).await.unwrap();
        assert!(!response.is_intercepting());
        response.end(Some(Bytes::from_static(b"abc"))).await.unwrap();

        let inner = response.get_ref();
        assert_eq!(inner.head().unwrap().headers()[header::CONTENT_LENGTH], "3");
        assert_eq!(inner.body(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn stage_error_finalizes_with_partial_body() {
        init_tracing();
        struct FailSecond(usize);
        impl Stage for FailSecond {
            fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError> {
                self.0 += 1;
                if self.0 > 1 {
                    return Err(StageError::transform("second chunk"));
                }
                out.push(chunk);
                Ok(())
            }
        }

        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&Interceptor::new(|_req: &RequestHead, _resp: &ResponseHead| FailSecond(0)));

        response.write_body(Bytes::from_static(b"one")).await.unwrap();
        let result = response.write_body(Bytes::from_static(b"two")).await;
        assert!(matches!(result, Err(SendError::Stage { .. })));

        let inner = response.get_ref();
        assert!(inner.is_ended());
        assert_eq!(inner.body(), Bytes::from_static(b"one"));

        assert!(matches!(response.end(None).await, Err(SendError::Finalized)));
    }

    #[tokio::test]
    async fn use_after_end_fails_loudly() {
        init_tracing();
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&suffix(b"bar"));
        response.end(Some(Bytes::from_static(b"foo"))).await.unwrap();

        assert!(matches!(response.write_body(Bytes::from_static(b"x")).await, Err(SendError::Finalized)));
        assert!(matches!(response.end(None).await, Err(SendError::Finalized)));
        assert!(matches!(response.write_head(StatusCode::OK, None, HeaderMap::new()).await, Err(SendError::Finalized)));
        assert_eq!(response.get_ref().body(), Bytes::from_static(b"foobar"));
    }

    #[tokio::test]
    async fn abort_stops_forwarding() {
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.attach(&suffix(b"bar"));
        response.write_body(Bytes::from_static(b"foo")).await.unwrap();

        response.abort();
        assert!(matches!(response.write_body(Bytes::from_static(b"foo")).await, Err(SendError::Aborted)));
        assert!(matches!(response.end(None).await, Err(SendError::Aborted)));

        let inner = response.get_ref();
        assert_eq!(inner.body(), Bytes::from_static(b"foobar"));
        assert!(!inner.is_ended());
    }

    #[tokio::test]
    async fn late_attach_is_ignored() {
        init_tracing();
        let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
        response.write_body(Bytes::from_static(b"foo")).await.unwrap();
        assert!(!response.is_intercepting());

        response.attach(&suffix(b"bar"));
        response.end(None).await.unwrap();
        assert_eq!(response.get_ref().body(), Bytes::from_static(b"foo"));
    }

    #[tokio::test]
    async fn concurrent_responses_keep_separate_state() {
        let interceptor = suffix(b"!");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let interceptor = interceptor.clone();
                tokio::spawn(async move {
                    let mut response = InterceptedResponse::new(request("/"), MemoryResponse::new());
                    response.attach(&interceptor);

                    let mut headers = HeaderMap::new();
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("6"));
                    response.write_head(StatusCode::OK, None, headers).await.unwrap();
                    for _ in 0..i {
                        tokio::task::yield_now().await;
                        response.write_body(Bytes::from(format!("{i}"))).await.unwrap();
                    }
                    response.end(None).await.unwrap();
                    (i, response.into_inner().body())
                })
            })
            .collect();

        for handle in handles {
            let (i, body) = handle.await.unwrap();
            assert_eq!(body, Bytes::from(format!("{i}!").repeat(i)));
        }
    }
}
