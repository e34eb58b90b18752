use bitflags::bitflags;

use crate::error::FrameError;
use crate::message_type::MessageType;

/// Frame magic, stored little-endian. On-wire bytes: `43 50 41 4C` (`"CPAL"`).
pub const MAGIC: u32 = 0x4C41_5043;

/// The only protocol version this codec speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Largest payload accepted on the wire (10 MiB).
pub const MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

/// Flag bits 6-7 must be zero.
pub const RESERVED_FLAG_BITS: u8 = 0b1100_0000;

const CHECKSUM_OFFSET: usize = 20;

bitflags! {
    /// Per-frame flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Payload is compressed.
        const COMPRESSED = 1 << 0;
        /// Reserved for payload encryption; never accepted.
        const ENCRYPTED = 1 << 1;
        /// Frame is one part of a larger streamed message.
        const STREAMING = 1 << 2;
        /// Sender asks for priority handling.
        const PRIORITY = 1 << 3;
        /// Frame is a request; the id expects a response.
        const REQUEST = 1 << 4;
        /// Frame is a response echoing a request id.
        const RESPONSE = 1 << 5;
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub msg_type: MessageType,
    pub payload_len: u32,
    pub message_id: u64,
    pub checksum: u32,
}

impl FrameHeader {
    /// Parse and validate the first [`HEADER_LEN`] bytes of `bytes`.
    ///
    /// Only the header is inspected, so an oversized frame is rejected
    /// before anyone waits for its payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let magic = read_u32(bytes, 0);
        if magic != MAGIC {
            return Err(FrameError::ProtocolMismatch { found: magic });
        }

        let version = bytes[4];
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion { found: version });
        }

        let raw_flags = bytes[5];
        if raw_flags & RESERVED_FLAG_BITS != 0 {
            return Err(FrameError::ReservedFlags { flags: raw_flags });
        }
        let flags = FrameFlags::from_bits_truncate(raw_flags);
        if flags.contains(FrameFlags::ENCRYPTED) {
            return Err(FrameError::EncryptionUnsupported);
        }

        let payload_len = read_u32(bytes, 8);
        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: payload_len as usize,
                max: MAX_PAYLOAD_LEN,
            });
        }

        Ok(Self {
            flags,
            msg_type: MessageType(u16::from_le_bytes([bytes[6], bytes[7]])),
            payload_len,
            message_id: read_u64(bytes, 12),
            checksum: read_u32(bytes, CHECKSUM_OFFSET),
        })
    }

    /// Serialize to the 24-byte wire form, including the stored checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4] = PROTOCOL_VERSION;
        out[5] = self.flags.bits();
        out[6..8].copy_from_slice(&self.msg_type.0.to_le_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        out[12..20].copy_from_slice(&self.message_id.to_le_bytes());
        out[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    /// CRC-32 over this header with the checksum zeroed, then `payload`.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut header = self.to_bytes();
        header[CHECKSUM_OFFSET..].fill(0);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Total frame size on the wire.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }

    /// Best-effort message id from raw bytes that may not form a valid header.
    pub fn peek_message_id(bytes: &[u8]) -> Option<u64> {
        (bytes.len() >= 20).then(|| read_u64(bytes, 12))
    }
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
