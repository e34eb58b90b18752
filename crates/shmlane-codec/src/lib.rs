//! Canonical frame codec for shmlane.
//!
//! Every message on a shmlane connection travels as one frame: a fixed
//! 24-byte little-endian header followed by an opaque payload.
//!
//! ```text
//! +--------+---------+-------+------+-------------+------------+----------+
//! | magic  | version | flags | type | payload_len | message_id | checksum |
//! | 4B     | 1B      | 1B    | 2B   | 4B          | 8B         | 4B       |
//! +--------+---------+-------+------+-------------+------------+----------+
//! ```
//!
//! The checksum is CRC-32 over the header (with the checksum field zeroed)
//! followed by the payload bytes exactly as they travel on the wire. Magic,
//! version, flags, length and checksum are all validated before the payload
//! is decompressed or handed to anyone.

mod compress;
mod error;
mod frame;
mod header;
mod message_type;

pub use compress::{CompressionError, Compressor, Deflate, NoCompression};
pub use error::{ErrorCode, ErrorPayload, FrameError};
pub use frame::{Frame, FrameCodec};
pub use header::{
    FrameFlags, FrameHeader, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
    RESERVED_FLAG_BITS,
};
pub use message_type::{MessageType, TypeRange, TypeRegistry};

/// Payloads larger than this are eligible for compression when requested.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;
