//! Registrations and the ordered registry they live in.
//!
//! An [`Interceptor`] is one registration: a [`Filter`] plus a [`StageFactory`]. It is
//! immutable and cheap to clone, so the same registration can be attached to any
//! number of concurrent responses. [`Interceptors`] keeps registrations in order and
//! attaches all of them to a response at once; that order is the order their stages
//! appear in the pipeline.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use micro_intercept::filter::Filter;
//! use micro_intercept::stage::stage_fn;
//! use micro_intercept::{Interceptor, Interceptors, RequestHead, ResponseHead};
//!
//! let shout = Interceptor::with_filter(
//!     Filter::builder().header("content-type", "text/plain")?.build(),
//!     |_req: &RequestHead, _resp: &ResponseHead| stage_fn(|chunk: Bytes| Bytes::from(chunk.to_ascii_uppercase())),
//! );
//!
//! let interceptors = Interceptors::builder().add_last(shout).build();
//! assert_eq!(interceptors.len(), 1);
//! # Ok::<(), micro_intercept::error::ConfigError>(())
//! ```

use crate::body::InterceptBody;
use crate::config::InterceptConfig;
use crate::filter::Filter;
use crate::intercepted::InterceptedResponse;
use crate::response::ResponseWriter;
use crate::session::{decide, strip_content_length};
use crate::stage::{Stage, StageFactory};
use crate::{RequestHead, ResponseHead};
use http::Response;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

struct Registration {
    filter: Filter,
    factory: Box<dyn StageFactory>,
}

/// A single registration: the filter deciding whether it applies and the factory
/// creating its stages.
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<Registration>,
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor").field("filter", &self.inner.filter).finish_non_exhaustive()
    }
}

impl Interceptor {
    /// Creates a registration which applies to every response.
    pub fn new<F: StageFactory + 'static>(factory: F) -> Self {
        Self::with_filter(Filter::any(), factory)
    }

    pub fn with_filter<F: StageFactory + 'static>(filter: Filter, factory: F) -> Self {
        Self { inner: Arc::new(Registration { filter, factory: Box::new(factory) }) }
    }

    pub fn filter(&self) -> &Filter {
        &self.inner.filter
    }

    pub(crate) fn create_stages(&self, req: &RequestHead, resp: &ResponseHead) -> Vec<Box<dyn Stage>> {
        self.inner.factory.create(req, resp)
    }
}

/// An ordered list of [`Interceptor`]s sharing one [`InterceptConfig`].
#[derive(Debug, Clone, Default)]
pub struct Interceptors {
    inner: Vec<Interceptor>,
    config: InterceptConfig,
}

impl Interceptors {
    pub fn builder() -> InterceptorsBuilder {
        InterceptorsBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    /// Creates the session for a push-style response and attaches every registration.
    pub fn wrap<W: ResponseWriter>(&self, request: RequestHead, writer: W) -> InterceptedResponse<W> {
        let mut response = InterceptedResponse::with_config(request, writer, self.config.clone());
        for interceptor in &self.inner {
            response.attach(interceptor);
        }
        response
    }

    /// Intercepts a response whose head is complete and whose body is pulled.
    ///
    /// The decision is taken right away. When intercepting, `content-length` is
    /// removed, so the transport falls back to chunked framing.
    pub fn intercept<B>(&self, request: &RequestHead, response: Response<B>) -> Response<InterceptBody<B>> {
        let (mut parts, body) = response.into_parts();
        let pipeline = decide(&self.inner, request, parts.status, &parts.headers, None, &self.config);

        if pipeline.is_some() && strip_content_length(&mut parts.headers) {
            debug!("removed content-length from intercepted response");
        }

        Response::from_parts(parts, InterceptBody::new(body, pipeline))
    }
}

#[derive(Debug, Default)]
pub struct InterceptorsBuilder {
    inner: Vec<Interceptor>,
    config: InterceptConfig,
}

impl InterceptorsBuilder {
    fn new() -> Self {
        Self { inner: vec![], config: InterceptConfig::default() }
    }

    pub fn add_last(mut self, interceptor: Interceptor) -> Self {
        self.inner.push(interceptor);
        self
    }

    pub fn add_first(mut self, interceptor: Interceptor) -> Self {
        self.inner.insert(0, interceptor);
        self
    }

    pub fn config(mut self, config: InterceptConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Interceptors {
        Interceptors { inner: self.inner, config: self.config }
    }
}
