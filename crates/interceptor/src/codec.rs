//! Content-encoding aware decode/encode stage pairs.
//!
//! The codec pair brackets the caller's stages: the decompressor turns the upstream
//! body into plaintext before any stage sees it, the compressor restores the declared
//! `content-encoding` afterwards. Only `gzip` and `deflate` are decoded; the match on
//! the header value is a token search rather than strict parsing, so values such as
//! `x-gzip` or `gzip, br` still select gzip.

use crate::config::InterceptConfig;
use crate::error::StageError;
use crate::stage::{PassThrough, Stage, StageOutput};
use bytes::{Bytes, BytesMut};
use flate2::write::{GzDecoder, GzEncoder, ZlibEncoder};
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io;
use std::io::Write;
use tracing::trace;

/// The content coding a response declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    /// No `content-encoding`, or `identity`.
    Identity,
    Gzip,
    Deflate,
    /// A coding this crate does not decode.
    Unrecognized,
}

impl ContentCoding {
    /// Detects the coding from a `content-encoding` value.
    pub fn detect(content_encoding: Option<&str>) -> Self {
        let Some(value) = content_encoding else {
            return Self::Identity;
        };

        if contains_token(value, "gzip") {
            Self::Gzip
        } else if contains_token(value, "deflate") {
            Self::Deflate
        } else if value.trim().is_empty() || value.trim().eq_ignore_ascii_case("identity") {
            Self::Identity
        } else {
            Self::Unrecognized
        }
    }

    /// Returns true when bytes on the wire differ from the plaintext.
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Gzip | Self::Deflate)
    }
}

fn contains_token(value: &str, token: &str) -> bool {
    value.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')).any(|t| t.eq_ignore_ascii_case(token))
}

/// A matched decompressor/compressor pair.
pub struct CodecPair {
    pub decompressor: Box<dyn Stage>,
    pub compressor: Box<dyn Stage>,
    pub coding: ContentCoding,
}

impl std::fmt::Debug for CodecPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPair").field("coding", &self.coding).finish_non_exhaustive()
    }
}

impl CodecPair {
    /// Selects the pair for a `content-encoding` value.
    ///
    /// Anything that is neither gzip nor deflate gets the identity pair.
    pub fn select(content_encoding: Option<&str>, config: &InterceptConfig) -> Self {
        let coding = ContentCoding::detect(content_encoding);
        Self::for_coding(coding, config)
    }

    pub fn for_coding(coding: ContentCoding, config: &InterceptConfig) -> Self {
        let capacity = config.buffer_capacity();
        let level = Compression::new(config.compression_level());

        let (decompressor, compressor): (Box<dyn Stage>, Box<dyn Stage>) = match coding {
            ContentCoding::Gzip => (
                Box::new(Decoder::Gzip(GzDecoder::new(Writer::with_capacity(capacity)))),
                Box::new(Encoder::Gzip(GzEncoder::new(Writer::with_capacity(capacity), level))),
            ),
            ContentCoding::Deflate => (
                Box::new(Decoder::Deflate(Inflate::with_capacity(capacity))),
                Box::new(Encoder::Deflate(ZlibEncoder::new(Writer::with_capacity(capacity), level))),
            ),
            ContentCoding::Identity | ContentCoding::Unrecognized => (Box::new(PassThrough), Box::new(PassThrough)),
        };

        Self { decompressor, compressor, coding }
    }

    pub fn is_compressed(&self) -> bool {
        self.coding.is_compressed()
    }
}

// inspired by actix-http: https://github.com/actix/actix-web/blob/master/actix-http/src/encoding/encoder.rs
pub(crate) struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Inflates a zlib stream, remembering whether its end marker was seen.
///
/// Unlike gzip, a zlib stream cut short carries no trailer which would fail the
/// decode, so completeness has to be checked when the body ends.
pub(crate) struct Inflate {
    decompress: Decompress,
    buf: Vec<u8>,
    capacity: usize,
    stream_end: bool,
}

impl Inflate {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(64);
        Self { decompress: Decompress::new(true), buf: Vec::with_capacity(capacity), capacity, stream_end: false }
    }

    fn write(&mut self, mut input: &[u8]) -> io::Result<()> {
        while !input.is_empty() {
            if self.stream_end {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "trailing bytes after the end of the deflate stream"));
            }

            self.buf.reserve(self.capacity);
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self.decompress.decompress_vec(input, &mut self.buf, FlushDecompress::None)?;

            let consumed = usize::try_from(self.decompress.total_in() - before_in).unwrap_or(input.len());
            let produced = self.decompress.total_out() - before_out;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => self.stream_end = true,
                Status::Ok | Status::BufError if consumed == 0 && produced == 0 => break,
                Status::Ok | Status::BufError => {}
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        // an empty body has nothing to terminate
        if self.stream_end || self.decompress.total_in() == 0 {
            return Ok(());
        }
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "deflate stream ended before its end marker"))
    }

    fn take(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buf))
    }
}

/// Turns compressed upstream bytes into plaintext.
pub(crate) enum Decoder {
    Gzip(GzDecoder<Writer>),
    Deflate(Inflate),
}

impl Decoder {
    fn name(&self) -> &'static str {
        match self {
            Self::Gzip(_) => "gzip",
            Self::Deflate(_) => "deflate",
        }
    }

    fn take(&mut self) -> Bytes {
        match self {
            Self::Gzip(decoder) => decoder.get_mut().take(),
            Self::Deflate(inflate) => inflate.take(),
        }
    }
}

impl Stage for Decoder {
    fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError> {
        let result = match self {
            Self::Gzip(decoder) => decoder.write_all(&chunk),
            Self::Deflate(inflate) => inflate.write(&chunk),
        };
        if let Err(err) = result {
            trace!("Error decoding {} encoding: {}", self.name(), err);
            return Err(err.into());
        }

        out.push(self.take());
        Ok(())
    }

    fn finish(&mut self, out: &mut StageOutput) -> Result<(), StageError> {
        let result = match self {
            Self::Gzip(decoder) => decoder.try_finish(),
            Self::Deflate(inflate) => inflate.finish(),
        };
        if let Err(err) = result {
            trace!("Error finishing {} decoding: {}", self.name(), err);
            return Err(err.into());
        }

        out.push(self.take());
        Ok(())
    }
}

/// Restores the declared encoding after the stages ran.
pub(crate) enum Encoder {
    Gzip(GzEncoder<Writer>),
    Deflate(ZlibEncoder<Writer>),
}

impl Encoder {
    fn name(&self) -> &'static str {
        match self {
            Self::Gzip(_) => "gzip",
            Self::Deflate(_) => "deflate",
        }
    }

    fn take(&mut self) -> Bytes {
        match self {
            Self::Gzip(encoder) => encoder.get_mut().take(),
            Self::Deflate(encoder) => encoder.get_mut().take(),
        }
    }
}

impl Stage for Encoder {
    fn transform(&mut self, chunk: Bytes, out: &mut StageOutput) -> Result<(), StageError> {
        let result = match self {
            Self::Gzip(encoder) => encoder.write_all(&chunk),
            Self::Deflate(encoder) => encoder.write_all(&chunk),
        };
        if let Err(err) = result {
            trace!("Error encoding {} encoding: {}", self.name(), err);
            return Err(err.into());
        }

        // the encoder keeps most of the input in its window, so this is often empty
        out.push(self.take());
        Ok(())
    }

    fn finish(&mut self, out: &mut StageOutput) -> Result<(), StageError> {
        let result = match self {
            Self::Gzip(encoder) => encoder.try_finish(),
            Self::Deflate(encoder) => encoder.try_finish(),
        };
        if let Err(err) = result {
            trace!("Error finishing {} encoding: {}", self.name(), err);
            return Err(err.into());
        }

        out.push(self.take());
        Ok(())
    }
}
