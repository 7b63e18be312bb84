//! Response filters deciding which registrations take part in a pipeline.
//!
//! A [`Filter`] holds an optional regex over the decoded request path and a set of
//! regexes over response header values. All of them must match (AND logic); a filter
//! without any pattern matches every response.
//!
//! Header values are resolved the same way everywhere in this crate: a header already
//! committed on the response wins over the one in the header-write call being
//! intercepted. A header found in neither never matches.
//!
//! # Examples
//!
//! ```
//! use micro_intercept::filter::Filter;
//!
//! let filter = Filter::builder()
//!     .path(r"^/assets/")?
//!     .header("Content-Type", r"text/css")?
//!     .build();
//! # Ok::<(), micro_intercept::error::ConfigError>(())
//! ```

use crate::error::ConfigError;
use http::{HeaderMap, HeaderName, Uri};
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::borrow::Cow;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    path: Option<Regex>,
    headers: Vec<(HeaderName, Regex)>,
}

impl Filter {
    /// Creates a filter which matches every response.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn builder() -> FilterBuilder {
        FilterBuilder::new()
    }

    /// Returns true if neither a path nor a header pattern is set.
    pub fn is_any(&self) -> bool {
        self.path.is_none() && self.headers.is_empty()
    }

    /// Checks the path and every header pattern.
    ///
    /// `committed` are the headers already set on the response, `pending` the ones
    /// passed to the header-write call which triggered the decision, if any.
    pub fn matches(&self, request_path: &str, pending: Option<&HeaderMap>, committed: &HeaderMap) -> bool {
        self.matches_path(request_path) && self.matches_headers(pending, committed)
    }

    pub fn matches_path(&self, request_path: &str) -> bool {
        match &self.path {
            Some(regex) => regex.is_match(request_path),
            None => true,
        }
    }

    pub fn matches_headers(&self, pending: Option<&HeaderMap>, committed: &HeaderMap) -> bool {
        for (name, regex) in &self.headers {
            match header_value(name, pending, committed) {
                Some(value) if regex.is_match(value) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Builder for [`Filter`], failing fast on invalid patterns.
#[derive(Debug, Default)]
pub struct FilterBuilder {
    path: Option<Regex>,
    headers: Vec<(HeaderName, Regex)>,
}

impl FilterBuilder {
    fn new() -> Self {
        Self { path: None, headers: vec![] }
    }

    /// Sets the pattern the decoded request path must match.
    pub fn path(self, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::invalid_pattern(pattern, e))?;
        Ok(self.path_regex(regex))
    }

    pub fn path_regex(mut self, regex: Regex) -> Self {
        self.path = Some(regex);
        self
    }

    /// Adds a pattern the value of header `name` must match.
    ///
    /// Header names are compared case-insensitively; setting the same name twice keeps
    /// the last pattern.
    pub fn header(self, name: &str, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::invalid_pattern(pattern, e))?;
        self.header_regex(name, regex)
    }

    pub fn header_regex(mut self, name: &str, regex: Regex) -> Result<Self, ConfigError> {
        // HeaderName lowercases on parse
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_e| ConfigError::invalid_header_name(name))?;

        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = regex,
            None => self.headers.push((name, regex)),
        }
        Ok(self)
    }

    pub fn build(self) -> Filter {
        Filter { path: self.path, headers: self.headers }
    }
}

/// Resolves a header value, committed headers first.
///
/// Values which are not visible ASCII can't be matched as text and count as absent.
pub fn header_value<'a>(name: &HeaderName, pending: Option<&'a HeaderMap>, committed: &'a HeaderMap) -> Option<&'a str> {
    committed
        .get(name)
        .or_else(|| pending.and_then(|headers| headers.get(name)))
        .and_then(|value| value.to_str().ok())
}

/// Returns the percent-decoded path and query of `uri`.
///
/// Paths which don't decode to UTF-8 are returned as they are.
pub fn decoded_path(uri: &Uri) -> Cow<'_, str> {
    let raw = uri.path_and_query().map_or("/", |pq| pq.as_str());
    percent_decode_str(raw).decode_utf8().unwrap_or(Cow::Borrowed(raw))
}
