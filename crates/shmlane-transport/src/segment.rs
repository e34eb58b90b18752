//! File-backed shared-memory segments, one per slot.

use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use shm_primitives::{ByteConsumer, ByteProducer, ByteRing, Region, RingError};

use crate::clock;
use crate::error::TransportError;
use crate::layout::{
    LayoutError, REQUEST_RING_OFFSET, SLOT_HEADER_SIZE, SlotHeader, response_ring_offset,
    segment_size,
};
use crate::security;

/// A `MAP_SHARED` mapping of a whole file.
struct Mapping {
    base_addr: *mut u8,
    size: usize,
    _file: File,
}

// SAFETY: the mapping is plain shared memory; all cross-thread access to it
// goes through atomics in the slot header and ring headers.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(file: File, size: usize) -> io::Result<Self> {
        // SAFETY: a fresh shared mapping of an open file descriptor.
        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base_addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base_addr: base_addr as *mut u8,
            size,
            _file: file,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base_addr and size came from a successful mmap.
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
    }
}

/// One slot's shared-memory segment: header plus request and response rings.
pub struct SlotSegment {
    mapping: Mapping,
    slot_id: u32,
    ring_capacity: u32,
    path: PathBuf,
}

impl SlotSegment {
    /// Create (or re-create) the segment file for `slot_id`. Listener side.
    pub fn create(path: &Path, slot_id: u32, ring_capacity: u32) -> Result<Self, TransportError> {
        match fs::symlink_metadata(path) {
            Ok(_) => {
                // Leftover from an earlier run; only ever replace our own file.
                security::validate_owned(path)?;
                fs::remove_file(path)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let size = segment_size(ring_capacity);
        let file = security::create_private_file(path)?;
        file.set_len(size as u64)?;
        let mapping = Mapping::map(file, size)?;

        // SAFETY: the file was just created exclusively; nobody else maps it yet.
        unsafe {
            SlotHeader::init(
                mapping.base_addr as *mut SlotHeader,
                slot_id,
                ring_capacity,
                clock::wall_ns(),
            );
        }
        let region = unsafe { Region::from_raw(mapping.base_addr, size) };
        unsafe {
            ByteRing::init(region, REQUEST_RING_OFFSET, ring_capacity)?;
            ByteRing::init(region, response_ring_offset(ring_capacity), ring_capacity)?;
        }

        tracing::debug!(slot_id, ring_capacity, path = %path.display(), "created slot segment");
        Ok(Self {
            mapping,
            slot_id,
            ring_capacity,
            path: path.to_path_buf(),
        })
    }

    /// Map an existing segment and validate its header. Client side.
    pub fn open(path: &Path, slot_id: u32) -> Result<Self, TransportError> {
        let file = security::open_private_file(path)?;
        let size = file.metadata()?.len() as usize;
        if size < SLOT_HEADER_SIZE {
            return Err(LayoutError::SegmentTooSmall {
                required: SLOT_HEADER_SIZE,
                found: size,
            }
            .into());
        }

        let mapping = Mapping::map(file, size)?;
        // SAFETY: at least SLOT_HEADER_SIZE bytes are mapped and page aligned.
        let header = unsafe { &*(mapping.base_addr as *const SlotHeader) };
        header.validate(slot_id)?;

        let ring_capacity = header.ring_capacity;
        let required = segment_size(ring_capacity);
        if size < required {
            return Err(LayoutError::SegmentTooSmall {
                required,
                found: size,
            }
            .into());
        }

        Ok(Self {
            mapping,
            slot_id,
            ring_capacity,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &SlotHeader {
        // SAFETY: validated or initialized at construction; lives as long as self.
        unsafe { &*(self.mapping.base_addr as *const SlotHeader) }
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn ring_capacity(&self) -> u32 {
        self.ring_capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn region(&self) -> Region {
        // SAFETY: the mapping outlives every Region handed out, because
        // callers hold an Arc<SlotSegment> alongside the rings.
        unsafe { Region::from_raw(self.mapping.base_addr, self.mapping.size) }
    }

    /// Request ring (client -> server).
    pub fn request_ring(&self) -> Result<ByteRing, RingError> {
        unsafe { ByteRing::attach(self.region(), REQUEST_RING_OFFSET) }
    }

    /// Response ring (server -> client).
    pub fn response_ring(&self) -> Result<ByteRing, RingError> {
        unsafe { ByteRing::attach(self.region(), response_ring_offset(self.ring_capacity)) }
    }

    /// Rewind both rings to empty.
    ///
    /// Only call while no connection is using the slot.
    pub fn reset_rings(&self) -> Result<(), RingError> {
        self.request_ring()?.reset();
        self.response_ring()?.reset();
        Ok(())
    }

    /// Server end: consume requests, produce responses.
    pub fn server_ends(&self) -> Result<(ByteProducer, ByteConsumer), RingError> {
        let (_, requests) = self.request_ring()?.split();
        let (responses, _) = self.response_ring()?.split();
        Ok((responses, requests))
    }

    /// Client end: produce requests, consume responses.
    pub fn client_ends(&self) -> Result<(ByteProducer, ByteConsumer), RingError> {
        let (requests, _) = self.request_ring()?.split();
        let (_, responses) = self.response_ring()?.split();
        Ok((requests, responses))
    }
}
