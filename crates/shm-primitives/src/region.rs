//! Raw memory regions backing rings and slot metadata.

use core::mem::{align_of, size_of};

/// A view of a contiguous memory region, typically an mmap'd shared segment.
///
/// `Region` does not own its memory. Whoever produced the pointer (an mmap
/// wrapper, a [`HeapRegion`]) must keep the memory alive for as long as any
/// copy of the `Region` is in use.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap a raw pointer and length.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for the
    /// lifetime of every copy of the returned region, and must be at least
    /// 64-byte aligned.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        debug_assert!(base as usize % 64 == 0, "region base must be 64-byte aligned");
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to `offset` bytes into the region.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.add(offset) }
    }

    /// Borrow a `T` living at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid, initialized `T`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        self.check::<T>(offset);
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Mutably borrow a `T` living at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to those bytes for the lifetime
    /// of the returned reference.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        self.check::<T>(offset);
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }

    #[inline]
    fn check<T>(&self, offset: usize) {
        assert!(
            offset + size_of::<T>() <= self.len,
            "region too small for requested type"
        );
        assert!(
            (self.base as usize + offset) % align_of::<T>() == 0,
            "misaligned access"
        );
    }
}

/// Heap-backed region, used by tests and by in-process rings.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: *mut u8,
    layout: alloc::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    /// Allocate `len` zeroed bytes aligned to a cache line.
    pub fn new_zeroed(len: usize) -> Self {
        let layout = match alloc::alloc::Layout::from_size_align(len.max(64), 64) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid heap region layout"),
        };
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Self { ptr, layout }
    }

    /// A non-owning view of this allocation.
    pub fn region(&self) -> Region {
        // SAFETY: the allocation lives as long as `self`, aligned to 64.
        unsafe { Region::from_raw(self.ptr, self.layout.size()) }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in new_zeroed.
        unsafe { alloc::alloc::dealloc(self.ptr, self.layout) }
    }
}
