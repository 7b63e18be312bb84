//! Interception settings shared by every session created from one
//! [`Interceptors`](crate::registry::Interceptors) instance.

/// What a matched response does when its `content-encoding` cannot be decoded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UnknownEncoding {
    /// Run the stages over the still encoded bytes, with identity codecs.
    #[default]
    TransformRaw,
    /// Leave the response untouched, stages are not created.
    PassThrough,
}

#[derive(Debug, Clone)]
pub struct InterceptConfig {
    compression_level: u32,
    unknown_encoding: UnknownEncoding,
    buffer_capacity: usize,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self { compression_level: 6, unknown_encoding: UnknownEncoding::default(), buffer_capacity: 4096 }
    }
}

impl InterceptConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the level used when re-compressing, clamped to `0..=9`.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn with_unknown_encoding(mut self, unknown_encoding: UnknownEncoding) -> Self {
        self.unknown_encoding = unknown_encoding;
        self
    }

    /// Sets the initial capacity of the codec output buffers.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    #[inline]
    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    #[inline]
    pub fn unknown_encoding(&self) -> UnknownEncoding {
        self.unknown_encoding
    }

    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}
