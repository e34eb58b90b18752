//! Pluggable payload compression.

use std::fmt;
use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

/// A payload compression algorithm.
///
/// Both ends of a connection must agree on the algorithm; the frame only
/// carries a "compressed" bit.
pub trait Compressor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress, failing with [`CompressionError::LimitExceeded`] rather
    /// than producing more than `max_output` bytes.
    fn decompress(&self, input: &[u8], max_output: usize) -> Result<Vec<u8>, CompressionError>;
}

/// Raw deflate (RFC 1951) via `flate2`.
#[derive(Debug, Clone, Copy)]
pub struct Deflate {
    level: u32,
}

impl Deflate {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for Deflate {
    fn default() -> Self {
        Self::new(Compression::fast().level())
    }
}

impl Compressor for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(input.len() / 2),
            Compression::new(self.level),
        );
        encoder.write_all(input)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, input: &[u8], max_output: usize) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::new();
        DeflateDecoder::new(input)
            .take(max_output as u64 + 1)
            .read_to_end(&mut out)?;
        if out.len() > max_output {
            return Err(CompressionError::LimitExceeded { limit: max_output });
        }
        Ok(out)
    }
}

/// Never compresses. A compressed frame received with this policy fails to decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(input.to_vec())
    }

    fn decompress(&self, _input: &[u8], _max_output: usize) -> Result<Vec<u8>, CompressionError> {
        Err(CompressionError::Unsupported("compression disabled"))
    }
}

/// Errors from a [`Compressor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// The underlying stream failed (malformed input, for instance).
    Io { kind: io::ErrorKind, message: String },
    /// Output would exceed the caller's limit.
    LimitExceeded { limit: usize },
    /// The configured policy cannot handle this payload.
    Unsupported(&'static str),
}

impl From<io::Error> for CompressionError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { message, .. } => write!(f, "compression stream error: {message}"),
            Self::LimitExceeded { limit } => {
                write!(f, "decompressed output exceeds {limit} bytes")
            }
            Self::Unsupported(why) => write!(f, "unsupported: {why}"),
        }
    }
}

impl std::error::Error for CompressionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_roundtrip() {
        let input = b"abcabcabc".repeat(500);
        let deflate = Deflate::default();
        let packed = deflate.compress(&input).unwrap();
        assert!(packed.len() < input.len());
        assert_eq!(deflate.decompress(&packed, input.len()).unwrap(), input);
    }

    #[test]
    fn deflate_enforces_output_limit() {
        let input = vec![0u8; 64 * 1024];
        let deflate = Deflate::default();
        let packed = deflate.compress(&input).unwrap();
        assert_eq!(
            deflate.decompress(&packed, 1024),
            Err(CompressionError::LimitExceeded { limit: 1024 })
        );
    }

    #[test]
    fn deflate_rejects_garbage() {
        let err = Deflate::default()
            .decompress(&[0xFF; 32], 1024)
            .unwrap_err();
        assert!(matches!(err, CompressionError::Io { .. }));
    }
}
