use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::DEFAULT_COMPRESSION_THRESHOLD;
use crate::compress::{Compressor, Deflate};
use crate::error::FrameError;
use crate::header::{FrameFlags, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::message_type::MessageType;

/// One decoded (or to-be-encoded) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub flags: FrameFlags,
    pub message_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            flags: FrameFlags::empty(),
            message_id: 0,
            payload: payload.into(),
        }
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn is_request(&self) -> bool {
        self.flags.contains(FrameFlags::REQUEST)
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(FrameFlags::RESPONSE)
    }
}

/// Encoder/decoder for frames with a compression policy.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compressor: Arc<dyn Compressor>,
    compression_threshold: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Arc::new(Deflate::default()), DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl FrameCodec {
    pub fn new(compressor: Arc<dyn Compressor>, compression_threshold: usize) -> Self {
        Self {
            compressor,
            compression_threshold,
        }
    }

    pub fn compressor(&self) -> &dyn Compressor {
        &*self.compressor
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Encode `frame` into header + payload bytes.
    ///
    /// With `compress` set, payloads above the threshold are compressed and
    /// the `COMPRESSED` bit is set, but only if that makes them smaller. Any
    /// `COMPRESSED` bit already present on `frame` is ignored.
    pub fn encode(&self, frame: &Frame, compress: bool) -> Result<Bytes, FrameError> {
        let mut out = BytesMut::new();
        self.encode_into(frame, compress, &mut out)?;
        Ok(out.freeze())
    }

    pub fn encode_into(
        &self,
        frame: &Frame,
        compress: bool,
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let mut flags = frame.flags - FrameFlags::COMPRESSED;
        if flags.contains(FrameFlags::ENCRYPTED) {
            return Err(FrameError::EncryptionUnsupported);
        }
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: frame.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut payload = frame.payload.clone();
        if compress && payload.len() > self.compression_threshold {
            let packed = self
                .compressor
                .compress(&payload)
                .map_err(FrameError::Compression)?;
            if packed.len() < payload.len() {
                tracing::trace!(
                    message_id = frame.message_id,
                    from = payload.len(),
                    to = packed.len(),
                    "compressed payload"
                );
                payload = Bytes::from(packed);
                flags |= FrameFlags::COMPRESSED;
            }
        }

        let mut header = FrameHeader {
            flags,
            msg_type: frame.msg_type,
            payload_len: payload.len() as u32,
            message_id: frame.message_id,
            checksum: 0,
        };
        header.checksum = header.compute_checksum(&payload);

        dst.reserve(HEADER_LEN + payload.len());
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode exactly one frame from `bytes`. Trailing bytes are an error.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        let header = FrameHeader::parse(bytes)?;
        if bytes.len() != header.frame_len() {
            return Err(FrameError::Truncated {
                needed: header.frame_len(),
                available: bytes.len(),
            });
        }
        self.finish(header, Bytes::copy_from_slice(&bytes[HEADER_LEN..]))
    }

    /// Decode the next frame from the front of `buf`, if a whole one is buffered.
    ///
    /// On success the frame's bytes are removed from `buf`. When the header
    /// is invalid nothing is consumed. When the checksum fails the frame's
    /// bytes are consumed so the stream stays aligned on the next header.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = FrameHeader::parse(&buf[..])?;
        if buf.len() < header.frame_len() {
            return Ok(None);
        }
        let mut raw = buf.split_to(header.frame_len()).freeze();
        raw.advance(HEADER_LEN);
        self.finish(header, raw).map(Some)
    }

    fn finish(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        let actual = header.compute_checksum(&payload);
        if actual != header.checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: header.checksum,
                actual,
                message_id: header.message_id,
            });
        }

        let mut flags = header.flags;
        let payload = if flags.contains(FrameFlags::COMPRESSED) {
            flags.remove(FrameFlags::COMPRESSED);
            let unpacked = self
                .compressor
                .decompress(&payload, MAX_PAYLOAD_LEN)
                .map_err(|e| match e {
                    crate::CompressionError::LimitExceeded { limit } => {
                        FrameError::PayloadTooLarge {
                            len: limit + 1,
                            max: MAX_PAYLOAD_LEN,
                        }
                    }
                    other => FrameError::Decompression(other),
                })?;
            Bytes::from(unpacked)
        } else {
            payload
        };

        Ok(Frame {
            msg_type: header.msg_type,
            flags,
            message_id: header.message_id,
            payload,
        })
    }
}
