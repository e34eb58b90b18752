//! Slot segment memory layout.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | SLOT HEADER (256 bytes)                                           |
//! |   magic "SHMLANE\0", version, slot_id, ring_capacity              |
//! |   SlotMeta (state, generation, last_activity)                     |
//! |   claim_nonce, server_pid, client_pid, closed flags, created_ns   |
//! +-------------------------------------------------------------------+
//! | REQUEST RING (client -> server)                                   |
//! |   ByteRingHeader (192B) + ring_capacity data bytes                |
//! +-------------------------------------------------------------------+
//! | RESPONSE RING (server -> client)                                  |
//! |   ByteRingHeader (192B) + ring_capacity data bytes                |
//! +-------------------------------------------------------------------+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use shm_primitives::{ByteRing, SlotMeta};
use static_assertions::const_assert_eq;

/// Magic bytes identifying a shmlane slot segment.
pub const SLOT_MAGIC: [u8; 8] = *b"SHMLANE\0";

/// Segment layout version.
pub const SLOT_LAYOUT_VERSION: u32 = 1;

pub const SLOT_HEADER_SIZE: usize = 256;

/// Offset of the request ring header.
pub const REQUEST_RING_OFFSET: usize = SLOT_HEADER_SIZE;

/// Header at the start of every slot segment (256 bytes).
#[repr(C, align(64))]
pub struct SlotHeader {
    /// Magic bytes: "SHMLANE\0".
    pub magic: [u8; 8],
    pub version: u32,
    pub slot_id: u32,
    /// Bytes per ring direction.
    pub ring_capacity: u32,
    pub _pad0: u32,

    /// Lifecycle state, generation and last activity (monotonic ns).
    pub meta: SlotMeta,

    /// Nonce from the lock file of the client this slot serves.
    pub claim_nonce: AtomicU64,
    pub server_pid: AtomicU32,
    pub client_pid: AtomicU32,
    pub server_closed: AtomicU32,
    pub client_closed: AtomicU32,

    /// Wall clock ns when the segment was created.
    pub created_ns: u64,

    pub _pad1: [u8; 184],
}

const_assert_eq!(core::mem::size_of::<SlotHeader>(), SLOT_HEADER_SIZE);
const_assert_eq!(core::mem::align_of::<SlotHeader>(), 64);

impl SlotHeader {
    /// Write a fresh header over raw segment bytes.
    ///
    /// # Safety
    ///
    /// `this` must point to at least [`SLOT_HEADER_SIZE`] writable bytes that
    /// no other thread or process accesses during the call.
    pub unsafe fn init(this: *mut Self, slot_id: u32, ring_capacity: u32, created_ns: u64) {
        unsafe {
            this.write(Self {
                magic: SLOT_MAGIC,
                version: SLOT_LAYOUT_VERSION,
                slot_id,
                ring_capacity,
                _pad0: 0,
                meta: SlotMeta::new(),
                claim_nonce: AtomicU64::new(0),
                server_pid: AtomicU32::new(0),
                client_pid: AtomicU32::new(0),
                server_closed: AtomicU32::new(0),
                client_closed: AtomicU32::new(0),
                created_ns,
                _pad1: [0; 184],
            });
        }
    }

    pub fn validate(&self, expected_slot: u32) -> Result<(), LayoutError> {
        if self.magic != SLOT_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        if self.version != SLOT_LAYOUT_VERSION {
            return Err(LayoutError::IncompatibleVersion {
                expected: SLOT_LAYOUT_VERSION,
                found: self.version,
            });
        }
        if self.slot_id != expected_slot {
            return Err(LayoutError::SlotMismatch {
                expected: expected_slot,
                found: self.slot_id,
            });
        }
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(LayoutError::InvalidCapacity(self.ring_capacity));
        }
        Ok(())
    }

    /// Clear per-connection fields before a slot is reused.
    pub fn clear_connection(&self) {
        self.claim_nonce.store(0, Ordering::Release);
        self.client_pid.store(0, Ordering::Release);
        self.server_pid.store(0, Ordering::Release);
        self.server_closed.store(0, Ordering::Release);
        self.client_closed.store(0, Ordering::Release);
    }

    #[inline]
    pub fn nonce(&self) -> u64 {
        self.claim_nonce.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_server_closed(&self) -> bool {
        self.server_closed.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn is_client_closed(&self) -> bool {
        self.client_closed.load(Ordering::Acquire) != 0
    }
}

/// Offset of the response ring header for a given capacity.
pub const fn response_ring_offset(ring_capacity: u32) -> usize {
    REQUEST_RING_OFFSET + ByteRing::required_size(ring_capacity)
}

/// Total segment size for a given ring capacity.
pub const fn segment_size(ring_capacity: u32) -> usize {
    SLOT_HEADER_SIZE + 2 * ByteRing::required_size(ring_capacity)
}

/// Errors from validating a slot segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    InvalidMagic,
    IncompatibleVersion { expected: u32, found: u32 },
    SlotMismatch { expected: u32, found: u32 },
    InvalidCapacity(u32),
    SegmentTooSmall { required: usize, found: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid magic bytes"),
            Self::IncompatibleVersion { expected, found } => write!(
                f,
                "incompatible layout version: expected {expected}, found {found}"
            ),
            Self::SlotMismatch { expected, found } => {
                write!(f, "segment belongs to slot {found}, expected {expected}")
            }
            Self::InvalidCapacity(c) => write!(f, "ring capacity {c} is not a power of 2"),
            Self::SegmentTooSmall { required, found } => {
                write!(f, "segment too small: need {required} bytes, found {found}")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn ring_offsets_are_cache_aligned() {
        for cap in [4096u32, 1 << 16, 1 << 20] {
            assert_eq!(response_ring_offset(cap) % 64, 0);
            assert_eq!(segment_size(cap), 256 + 2 * (192 + cap as usize));
        }
        assert_eq!(offset_of!(SlotHeader, meta) % 8, 0);
        assert_eq!(size_of::<SlotMeta>(), 16);
    }

    #[test]
    fn validate_checks_identity() {
        let mut raw = Box::new(std::mem::MaybeUninit::<SlotHeader>::zeroed());
        unsafe { SlotHeader::init(raw.as_mut_ptr(), 3, 4096, 0) };
        let header = unsafe { raw.assume_init_ref() };

        header.validate(3).unwrap();
        assert_eq!(
            header.validate(4),
            Err(LayoutError::SlotMismatch {
                expected: 4,
                found: 3
            })
        );
    }
}
