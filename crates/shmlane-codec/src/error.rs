use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::compress::CompressionError;

/// Errors produced while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Magic bytes did not match.
    ProtocolMismatch { found: u32 },
    /// Protocol version is not supported.
    UnsupportedVersion { found: u8 },
    /// Payload length exceeds the maximum.
    PayloadTooLarge { len: usize, max: usize },
    /// Checksum stored in the header does not match the frame contents.
    ChecksumMismatch {
        expected: u32,
        actual: u32,
        message_id: u64,
    },
    /// One of the reserved flag bits is set.
    ReservedFlags { flags: u8 },
    /// The encrypted flag is set; encryption is not implemented.
    EncryptionUnsupported,
    /// Not enough bytes for a header or a full frame.
    Truncated { needed: usize, available: usize },
    /// Compressing an outgoing payload failed.
    Compression(CompressionError),
    /// Decompressing a verified payload failed.
    Decompression(CompressionError),
}

impl FrameError {
    /// Wire error code sent to the peer in an ERROR frame.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            Self::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::ReservedFlags { .. } => ErrorCode::ReservedFlags,
            Self::EncryptionUnsupported => ErrorCode::EncryptionUnsupported,
            Self::Decompression(_) => ErrorCode::Decompression,
            Self::Truncated { .. } | Self::Compression(_) => ErrorCode::Internal,
        }
    }

    /// Whether the receiving side must close the connection.
    ///
    /// A checksum mismatch leaves the byte stream aligned (the length field
    /// was valid), so the receiver may request a retransmit instead.
    /// Local encode failures never involve the peer.
    pub fn closes_connection(&self) -> bool {
        !matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::Truncated { .. } | Self::Compression(_)
        )
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolMismatch { found } => write!(f, "bad frame magic {found:#010x}"),
            Self::UnsupportedVersion { found } => {
                write!(f, "unsupported protocol version {found}")
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds maximum {max}")
            }
            Self::ChecksumMismatch {
                expected,
                actual,
                message_id,
            } => write!(
                f,
                "checksum mismatch on message {message_id}: header {expected:#010x}, computed {actual:#010x}"
            ),
            Self::ReservedFlags { flags } => write!(f, "reserved flag bits set: {flags:#04x}"),
            Self::EncryptionUnsupported => write!(f, "encrypted frames are not supported"),
            Self::Truncated { needed, available } => {
                write!(f, "truncated frame: need {needed} bytes, have {available}")
            }
            Self::Compression(e) => write!(f, "compression failed: {e}"),
            Self::Decompression(e) => write!(f, "decompression failed: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Compression(e) | Self::Decompression(e) => Some(e),
            _ => None,
        }
    }
}

/// Error codes carried in ERROR frame payloads.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ProtocolMismatch = 1,
    UnsupportedVersion = 2,
    PayloadTooLarge = 3,
    ChecksumMismatch = 4,
    ReservedFlags = 5,
    EncryptionUnsupported = 6,
    Decompression = 7,
    Internal = 8,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::ProtocolMismatch,
            2 => Self::UnsupportedVersion,
            3 => Self::PayloadTooLarge,
            4 => Self::ChecksumMismatch,
            5 => Self::ReservedFlags,
            6 => Self::EncryptionUnsupported,
            7 => Self::Decompression,
            8 => Self::Internal,
            _ => return None,
        })
    }
}

/// Payload of an ERROR frame: code (u16 LE), offending message id (u64 LE),
/// then a UTF-8 detail string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Raw code; see [`ErrorPayload::code`].
    pub raw_code: u16,
    pub message_id: u64,
    pub detail: String,
}

impl ErrorPayload {
    const FIXED_LEN: usize = 10;

    pub fn new(code: ErrorCode, message_id: u64, detail: impl Into<String>) -> Self {
        Self {
            raw_code: code as u16,
            message_id,
            detail: detail.into(),
        }
    }

    /// Build the payload describing a decode failure.
    pub fn from_frame_error(err: &FrameError, message_id: u64) -> Self {
        Self::new(err.error_code(), message_id, err.to_string())
    }

    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u16(self.raw_code)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_LEN + self.detail.len());
        buf.put_u16_le(self.raw_code);
        buf.put_u64_le(self.message_id);
        buf.put_slice(self.detail.as_bytes());
        buf.freeze()
    }

    /// Parse an ERROR payload. Invalid UTF-8 in the detail is replaced.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < Self::FIXED_LEN {
            return Err(FrameError::Truncated {
                needed: Self::FIXED_LEN,
                available: bytes.len(),
            });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[2..10]);
        Ok(Self {
            raw_code: u16::from_le_bytes([bytes[0], bytes[1]]),
            message_id: u64::from_le_bytes(id),
            detail: String::from_utf8_lossy(&bytes[Self::FIXED_LEN..]).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_layout() {
        let payload = ErrorPayload::new(ErrorCode::ChecksumMismatch, 7, "bad crc");
        let bytes = payload.encode();
        assert_eq!(&bytes[..2], &[4, 0]);
        assert_eq!(&bytes[2..10], &7u64.to_le_bytes());
        assert_eq!(&bytes[10..], b"bad crc");

        let decoded = ErrorPayload::decode(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.code(), Some(ErrorCode::ChecksumMismatch));
    }

    #[test]
    fn unknown_codes_survive_decoding() {
        let mut bytes = ErrorPayload::new(ErrorCode::Internal, 1, "").encode().to_vec();
        bytes[0] = 0x99;
        let decoded = ErrorPayload::decode(&bytes).unwrap();
        assert_eq!(decoded.raw_code, 0x99);
        assert_eq!(decoded.code(), None);
    }

    #[test]
    fn close_policy_classification() {
        assert!(FrameError::ProtocolMismatch { found: 0 }.closes_connection());
        assert!(FrameError::UnsupportedVersion { found: 9 }.closes_connection());
        assert!(FrameError::PayloadTooLarge { len: 1, max: 0 }.closes_connection());
        assert!(FrameError::EncryptionUnsupported.closes_connection());
        assert!(
            !FrameError::ChecksumMismatch {
                expected: 1,
                actual: 2,
                message_id: 3
            }
            .closes_connection()
        );
    }
}
