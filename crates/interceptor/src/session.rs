//! Per-response interception state and the one-time decision.
//!
//! Every response owns exactly one session. Nothing in here is shared between
//! responses: registrations are immutable and only read, while the pipeline and the
//! state are created for and owned by a single response.

use crate::codec::{CodecPair, ContentCoding};
use crate::config::{InterceptConfig, UnknownEncoding};
use crate::filter::{decoded_path, header_value};
use crate::pipeline::Pipeline;
use crate::registry::Interceptor;
use crate::stage::Stage;
use crate::{RequestHead, ResponseHead};
use http::{HeaderMap, StatusCode, header};
use tracing::{debug, warn};

/// Lifecycle of a session.
///
/// `Idle` moves to `Intercepting` or `PassingThrough` on the first header-write,
/// body-write or end call; the decision itself never spans an await point.
#[derive(Debug)]
pub(crate) enum SessionState {
    Idle,
    Intercepting(Pipeline),
    PassingThrough,
    Finalized,
    Aborted,
}

impl SessionState {
    pub(crate) fn is_decided(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Evaluates every registration and builds the pipeline, if anything matched.
///
/// Returns `None` when the response passes through untouched.
pub(crate) fn decide(
    registrations: &[Interceptor],
    request: &RequestHead,
    status: StatusCode,
    committed: &HeaderMap,
    pending: Option<&HeaderMap>,
    config: &InterceptConfig,
) -> Option<Pipeline> {
    let path = decoded_path(request.uri());
    let matched: Vec<&Interceptor> =
        registrations.iter().filter(|r| r.filter().matches(&path, pending, committed)).collect();

    if matched.is_empty() {
        debug!(path = %path, registrations = registrations.len(), "no registration matched, passing through");
        return None;
    }

    let content_encoding = header_value(&header::CONTENT_ENCODING, pending, committed);
    let coding = ContentCoding::detect(content_encoding);
    if coding == ContentCoding::Unrecognized {
        match config.unknown_encoding() {
            UnknownEncoding::TransformRaw => {
                debug!(content_encoding = ?content_encoding, "unrecognized content-encoding, transforming raw bytes");
            }
            UnknownEncoding::PassThrough => {
                warn!(content_encoding = ?content_encoding, "unrecognized content-encoding, passing through");
                return None;
            }
        }
    }

    let snapshot = snapshot(status, committed, pending);
    let stages: Vec<Box<dyn Stage>> = matched.iter().flat_map(|r| r.create_stages(request, &snapshot)).collect();
    if stages.is_empty() {
        debug!(path = %path, "matched registrations created no stages, passing through");
        return None;
    }

    debug!(path = %path, matched = matched.len(), stages = stages.len(), coding = ?coding, "intercepting response");
    Some(Pipeline::with_codec(CodecPair::for_coding(coding, config), stages))
}

/// Merges pending and committed headers, committed values winning.
fn snapshot(status: StatusCode, committed: &HeaderMap, pending: Option<&HeaderMap>) -> ResponseHead {
    let mut headers = pending.cloned().unwrap_or_default();
    for name in committed.keys() {
        headers.remove(name);
    }
    for (name, value) in committed {
        headers.append(name.clone(), value.clone());
    }

    let mut head = ResponseHead::default();
    *head.status_mut() = status;
    *head.headers_mut() = headers;
    head
}

/// Removes every `content-length` value, returning true if there was one.
pub(crate) fn strip_content_length(headers: &mut HeaderMap) -> bool {
    // HeaderMap keys are lowercase, so this also drops differently cased duplicates
    headers.remove(header::CONTENT_LENGTH).is_some()
}
