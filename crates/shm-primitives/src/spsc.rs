use core::fmt;
use core::mem::size_of;
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// SPSC byte ring header (192 bytes, cache-line aligned fields).
#[repr(C)]
pub struct ByteRingHeader {
    /// Total bytes ever published (written by producer, read by consumer).
    pub write_cursor: AtomicU64,
    _pad1: [u8; 56],

    /// Total bytes ever consumed (written by consumer, read by producer).
    pub read_cursor: AtomicU64,
    _pad2: [u8; 56],

    /// Ring capacity in bytes (power of 2, immutable after init).
    pub capacity: u32,
    _pad3: [u8; 60],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<ByteRingHeader>() == 192);

impl ByteRingHeader {
    /// Initialize a new ring header.
    pub fn init(&mut self, capacity: u32) {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        // The old contents are raw shared bytes; overwrite without dropping them.
        unsafe {
            ptr::write(self, Self {
                write_cursor: AtomicU64::new(0),
                _pad1: [0; 56],
                read_cursor: AtomicU64::new(0),
                _pad2: [0; 56],
                capacity,
                _pad3: [0; 60],
            });
        }
    }

    /// Rewind both cursors to zero.
    ///
    /// Only sound while neither a producer nor a consumer is operating on the
    /// ring, e.g. while the owning slot is being reclaimed.
    pub fn reset(&self) {
        self.read_cursor.store(0, Ordering::Release);
        self.write_cursor.store(0, Ordering::Release);
    }

    #[inline]
    pub fn mask(&self) -> u64 {
        self.capacity as u64 - 1
    }

    /// Unread bytes, or an error if the cursors violate `0 <= used <= capacity`.
    #[inline]
    pub fn used(&self) -> Result<u64, RingError> {
        let read = self.read_cursor.load(Ordering::Acquire);
        let write = self.write_cursor.load(Ordering::Acquire);
        checked_used(write, read, self.capacity)
    }
}

#[inline]
fn checked_used(write: u64, read: u64, capacity: u32) -> Result<u64, RingError> {
    let used = write.wrapping_sub(read);
    if used > capacity as u64 {
        return Err(RingError::Corrupted {
            write_cursor: write,
            read_cursor: read,
            capacity,
        });
    }
    Ok(used)
}

/// Outcome of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// All bytes were copied and published.
    Written(usize),
    /// Not enough free space; nothing was written.
    WouldBlock,
}

impl WriteResult {
    #[inline]
    pub fn is_would_block(self) -> bool {
        matches!(self, WriteResult::WouldBlock)
    }
}

/// Errors surfaced by ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Cursor invariant violated. Fatal to the ring's owning slot.
    Corrupted {
        write_cursor: u64,
        read_cursor: u64,
        capacity: u32,
    },
    /// A single write can never fit in the ring.
    TooLarge { len: usize, capacity: u32 },
    /// Capacity is zero or not a power of two.
    InvalidCapacity(u32),
    /// Region cannot hold the header plus data bytes.
    RegionTooSmall { required: usize, available: usize },
    /// Header offset is not 64-byte aligned.
    Misaligned(usize),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupted {
                write_cursor,
                read_cursor,
                capacity,
            } => write!(
                f,
                "ring cursors corrupted: write={write_cursor} read={read_cursor} capacity={capacity}"
            ),
            Self::TooLarge { len, capacity } => {
                write!(f, "write of {len} bytes exceeds ring capacity {capacity}")
            }
            Self::InvalidCapacity(c) => write!(f, "ring capacity {c} is not a power of 2"),
            Self::RegionTooSmall {
                required,
                available,
            } => write!(f, "region too small for ring: need {required}, have {available}"),
            Self::Misaligned(offset) => {
                write!(f, "ring header offset {offset} is not 64-byte aligned")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RingError {}

/// A lock-free SPSC byte ring in a shared memory region.
///
/// The ring itself offers no operations that move data; call [`ByteRing::split`]
/// to obtain the single producer and single consumer.
pub struct ByteRing {
    region: Region,
    header_offset: usize,
    data_offset: usize,
    capacity: u32,
}

unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// Bytes needed for a ring of `capacity` data bytes, header included.
    pub const fn required_size(capacity: u32) -> usize {
        size_of::<ByteRingHeader>() + capacity as usize
    }

    /// Initialize a new ring in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        capacity: u32,
    ) -> Result<Self, RingError> {
        Self::check_layout(&region, header_offset, capacity)?;
        let header = unsafe { region.get_mut::<ByteRingHeader>(header_offset) };
        header.init(capacity);
        Ok(Self::from_parts(region, header_offset, capacity))
    }

    /// Attach to an existing ring in the region.
    ///
    /// # Safety
    ///
    /// The region must contain a ring header previously written by [`ByteRing::init`].
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, RingError> {
        if !header_offset.is_multiple_of(64) {
            return Err(RingError::Misaligned(header_offset));
        }
        if header_offset + size_of::<ByteRingHeader>() > region.len() {
            return Err(RingError::RegionTooSmall {
                required: header_offset + size_of::<ByteRingHeader>(),
                available: region.len(),
            });
        }
        let capacity = unsafe { region.get::<ByteRingHeader>(header_offset) }.capacity;
        Self::check_layout(&region, header_offset, capacity)?;
        Ok(Self::from_parts(region, header_offset, capacity))
    }

    fn check_layout(region: &Region, header_offset: usize, capacity: u32) -> Result<(), RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }
        if !header_offset.is_multiple_of(64) {
            return Err(RingError::Misaligned(header_offset));
        }
        let required = header_offset + Self::required_size(capacity);
        if required > region.len() {
            return Err(RingError::RegionTooSmall {
                required,
                available: region.len(),
            });
        }
        Ok(())
    }

    fn from_parts(region: Region, header_offset: usize, capacity: u32) -> Self {
        Self {
            region,
            header_offset,
            data_offset: header_offset + size_of::<ByteRingHeader>(),
            capacity,
        }
    }

    #[inline]
    fn header(&self) -> &ByteRingHeader {
        unsafe { self.region.get::<ByteRingHeader>(self.header_offset) }
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.capacity as u64 - 1
    }

    /// Copy `bytes` into the data area starting at logical `cursor`.
    ///
    /// # Safety
    ///
    /// `bytes.len()` bytes starting at `cursor` must be free (not unread).
    unsafe fn copy_in(&self, cursor: u64, bytes: &[u8]) {
        let capacity = self.capacity as usize;
        let index = (cursor & self.mask()) as usize;
        let first = bytes.len().min(capacity - index);
        let data = self.region.offset(self.data_offset);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(index), first);
            if first < bytes.len() {
                ptr::copy_nonoverlapping(bytes.as_ptr().add(first), data, bytes.len() - first);
            }
        }
    }

    /// Copy `out.len()` bytes from the data area starting at logical `cursor`.
    ///
    /// # Safety
    ///
    /// `out.len()` bytes starting at `cursor` must be published and unread.
    unsafe fn copy_out(&self, cursor: u64, out: &mut [u8]) {
        let capacity = self.capacity as usize;
        let index = (cursor & self.mask()) as usize;
        let first = out.len().min(capacity - index);
        let data = self.region.offset(self.data_offset);
        unsafe {
            ptr::copy_nonoverlapping(data.add(index), out.as_mut_ptr(), first);
            if first < out.len() {
                ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), out.len() - first);
            }
        }
    }

    /// Returns the ring capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Rewind the ring to empty. See [`ByteRingHeader::reset`].
    pub fn reset(&self) {
        self.header().reset();
    }

    /// Returns a status snapshot of the cursors.
    pub fn status(&self) -> RingStatus {
        let header = self.header();
        let read_cursor = header.read_cursor.load(Ordering::Acquire);
        let write_cursor = header.write_cursor.load(Ordering::Acquire);
        RingStatus {
            write_cursor,
            read_cursor,
            capacity: self.capacity,
            used: write_cursor.wrapping_sub(read_cursor),
        }
    }

    /// Split into producer and consumer handles.
    pub fn split(self) -> (ByteProducer, ByteConsumer) {
        let consumer = ByteConsumer {
            ring: Self::from_parts(self.region, self.header_offset, self.capacity),
        };
        (ByteProducer { ring: self }, consumer)
    }
}

/// Producer handle for the ring. There must be exactly one per ring.
pub struct ByteProducer {
    ring: ByteRing,
}

/// Consumer handle for the ring. There must be exactly one per ring.
pub struct ByteConsumer {
    ring: ByteRing,
}

impl ByteProducer {
    /// Try to write all of `bytes`.
    ///
    /// Either every byte is copied and then published with a single release
    /// store of the write cursor, or nothing happens and `WouldBlock` is
    /// returned. Readers therefore never observe a partially copied write.
    pub fn try_write(&mut self, bytes: &[u8]) -> Result<WriteResult, RingError> {
        let capacity = self.ring.capacity;
        if bytes.len() > capacity as usize {
            return Err(RingError::TooLarge {
                len: bytes.len(),
                capacity,
            });
        }

        let header = self.ring.header();
        let write = header.write_cursor.load(Ordering::Relaxed);
        let read = header.read_cursor.load(Ordering::Acquire);
        let used = checked_used(write, read, capacity)?;

        if bytes.is_empty() {
            return Ok(WriteResult::Written(0));
        }
        if (capacity as u64 - used) < bytes.len() as u64 {
            return Ok(WriteResult::WouldBlock);
        }

        unsafe { self.ring.copy_in(write, bytes) };
        header
            .write_cursor
            .store(write.wrapping_add(bytes.len() as u64), Ordering::Release);

        Ok(WriteResult::Written(bytes.len()))
    }

    /// Free bytes available to the producer right now.
    pub fn free_space(&self) -> Result<usize, RingError> {
        let used = self.ring.header().used()?;
        Ok((self.ring.capacity as u64 - used) as usize)
    }

    /// Used / total capacity, in `0.0..=1.0`.
    pub fn occupancy(&self) -> f64 {
        occupancy(&self.ring)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity
    }

    pub fn status(&self) -> RingStatus {
        self.ring.status()
    }
}

impl ByteConsumer {
    /// Read up to `buf.len()` unread bytes.
    ///
    /// Returns `Ok(None)` when the ring is empty; that is not an error.
    pub fn try_read_into(&mut self, buf: &mut [u8]) -> Result<Option<usize>, RingError> {
        let header = self.ring.header();
        let read = header.read_cursor.load(Ordering::Relaxed);
        let write = header.write_cursor.load(Ordering::Acquire);
        let used = checked_used(write, read, self.ring.capacity)?;

        if used == 0 {
            return Ok(None);
        }

        let n = (used as usize).min(buf.len());
        unsafe { self.ring.copy_out(read, &mut buf[..n]) };
        header
            .read_cursor
            .store(read.wrapping_add(n as u64), Ordering::Release);

        Ok(Some(n))
    }

    /// Read up to `max` unread bytes into a fresh vector.
    #[cfg(any(test, feature = "alloc"))]
    pub fn try_read(&mut self, max: usize) -> Result<Option<alloc::vec::Vec<u8>>, RingError> {
        let available = self.available()?;
        if available == 0 {
            return Ok(None);
        }
        let mut buf = alloc::vec![0u8; available.min(max)];
        match self.try_read_into(&mut buf)? {
            Some(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Unread bytes available to the consumer right now.
    pub fn available(&self) -> Result<usize, RingError> {
        Ok(self.ring.header().used()? as usize)
    }

    /// Used / total capacity, in `0.0..=1.0`.
    pub fn occupancy(&self) -> f64 {
        occupancy(&self.ring)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity
    }
}

fn occupancy(ring: &ByteRing) -> f64 {
    let status = ring.status();
    status.used.min(status.capacity as u64) as f64 / status.capacity as f64
}

/// Status snapshot of a ring.
#[derive(Debug, Clone, Copy)]
pub struct RingStatus {
    pub write_cursor: u64,
    pub read_cursor: u64,
    pub capacity: u32,
    pub used: u64,
}
