//! Error types for response interception.
//!
//! Errors are split by the moment they can happen:
//!
//! - [`ConfigError`]: raised while building a [`Filter`](crate::filter::Filter), never
//!   during a live response
//! - [`StageError`]: raised by a [`Stage`](crate::stage::Stage) or a codec while bytes
//!   move through the pipeline
//! - [`SendError`]: raised while writing a response, either by the host or by the
//!   interception session in front of it
//! - [`InterceptError`]: top-level error, used as the error type of
//!   [`InterceptBody`](crate::body::InterceptBody)

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("config error: {source}")]
    ConfigError {
        #[from]
        source: ConfigError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },
}

impl From<StageError> for InterceptError {
    fn from(e: StageError) -> Self {
        SendError::from(e).into()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid header name `{name}`")]
    InvalidHeaderName { name: String },
}

impl ConfigError {
    pub fn invalid_pattern<S: ToString>(pattern: S, source: regex::Error) -> Self {
        Self::InvalidPattern { pattern: pattern.to_string(), source }
    }

    pub fn invalid_header_name<S: ToString>(name: S) -> Self {
        Self::InvalidHeaderName { name: name.to_string() }
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("transform failed: {reason}")]
    Transform { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl StageError {
    pub fn transform<S: ToString>(str: S) -> Self {
        Self::Transform { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("headers have already been sent")]
    HeadersSent,

    #[error("pipeline error: {source}")]
    Stage {
        #[from]
        source: StageError,
    },

    /// Any write after the response has been finalized. This is a caller bug.
    #[error("response has already been finalized")]
    Finalized,

    #[error("response has been aborted")]
    Aborted,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
