//! Lock-free primitives for shared memory IPC.
//!
//! This crate provides `no_std`-compatible, lock-free data structures designed
//! for use in shared memory contexts where you work with raw pointers to
//! memory-mapped regions.
//!
//! # Primitives
//!
//! - [`ByteRing`]: single-producer single-consumer byte ring with all-or-nothing
//!   writes, split into a [`ByteProducer`] and a [`ByteConsumer`]
//! - [`SlotMeta`]: per-slot atomic lifecycle state plus an activity stamp, with
//!   the claim / touch / reclaim protocol used by slot pools
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification.
//!
//! ```text
//! cargo test -p shm-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod region;
pub mod slot;
pub mod spsc;
pub mod sync;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use slot::{ReclaimAttempt, SlotMeta, SlotState, TransitionError};
pub use spsc::{
    ByteConsumer, ByteProducer, ByteRing, ByteRingHeader, RingError, RingStatus, WriteResult,
};
