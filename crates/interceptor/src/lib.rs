//! Transparent interception of HTTP response bodies
//!
//! This crate sits between a response producer and the transport and lets registered
//! interceptors rewrite the body while it streams. It decides once per response, on the
//! first header or body write, whether anything applies; if not, every call is forwarded
//! untouched.
//!
//! When a response is intercepted, its body flows through a pipeline:
//!
//! ```text
//! upstream bytes -> decompressor -> stage 1 -> ... -> stage n -> compressor -> transport
//! ```
//!
//! The codecs follow the response's `content-encoding` (gzip and deflate are handled,
//! anything else is configurable), so stages always see plain bytes and the client
//! still receives the encoding it was promised. Because the body length changes,
//! `content-length` is dropped and the response falls back to chunked framing.
//!
//! # Features
//!
//! - Regex filters over the decoded request path and response header values
//! - Ordered registrations, shared between any number of concurrent responses
//! - Push style hosts through [`ResponseWriter`] and [`InterceptedResponse`]
//! - Pull style hosts through [`Interceptors::intercept`] and [`InterceptBody`]
//! - In-flight gzip and deflate decoding and re-encoding
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use micro_intercept::filter::Filter;
//! use micro_intercept::stage::stage_fn;
//! use micro_intercept::{Interceptor, Interceptors, MemoryResponse, RequestHead, ResponseHead, ResponseWriter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let interceptors = Interceptors::builder()
//!     .add_last(Interceptor::with_filter(
//!         Filter::builder().path("^/hello")?.build(),
//!         |_req: &RequestHead, _resp: &ResponseHead| {
//!             stage_fn(|chunk: Bytes| Bytes::from(chunk.to_ascii_uppercase()))
//!         },
//!     ))
//!     .build();
//!
//! let request = RequestHead::builder().uri("/hello").body(())?;
//! let mut response = interceptors.wrap(request, MemoryResponse::new());
//!
//! response.write_body(Bytes::from_static(b"hello ")).await?;
//! response.end(Some(Bytes::from_static(b"world"))).await?;
//!
//! assert_eq!(response.get_ref().body(), Bytes::from_static(b"HELLO WORLD"));
//! # Ok(())
//! # }
//! ```

mod utils;

pub mod body;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod stage;

mod intercepted;
mod registry;
mod response;
mod session;

pub use body::InterceptBody;
pub use intercepted::InterceptedResponse;
pub use registry::{Interceptor, Interceptors, InterceptorsBuilder};
pub use response::{MemoryResponse, RequestHead, ResponseHead, ResponseWriter};
