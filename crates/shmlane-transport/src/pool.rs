//! Slot pool: an arena of slot segments indexed by slot id.
//!
//! The pool owns every segment it creates. Slot state itself lives in each
//! segment's header (so clients can watch it), and every transition is a CAS
//! on that state. Connections refer to slots by id and generation only.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use shm_primitives::{SlotMeta, SlotState};

use crate::clock;
use crate::error::{PoolError, TransportError};
use crate::lockfile;
use crate::metrics::TransportMetrics;
use crate::namespace::Namespace;
use crate::segment::SlotSegment;

struct SlotEntry {
    segment: OnceLock<Arc<SlotSegment>>,
}

/// A successfully claimed slot.
#[derive(Clone)]
pub struct SlotClaim {
    pub slot_id: u32,
    pub generation: u32,
    pub segment: Arc<SlotSegment>,
}

impl std::fmt::Debug for SlotClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotClaim")
            .field("slot_id", &self.slot_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Counts of slots by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: usize,
    pub max_slots: usize,
    pub free: usize,
    pub claimed: usize,
    pub active: usize,
    pub reclaimable: usize,
}

pub struct SlotPool {
    namespace: Namespace,
    ring_capacity: u32,
    entries: Box<[SlotEntry]>,
    allocated: AtomicUsize,
    grow_lock: Mutex<()>,
    metrics: Arc<TransportMetrics>,
}

impl SlotPool {
    /// Create the pool and eagerly build `warm_pool_size` segments (ids `0..warm`).
    pub fn initialize(
        namespace: Namespace,
        ring_capacity: u32,
        warm_pool_size: usize,
        max_slots: usize,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self, TransportError> {
        let entries = (0..max_slots)
            .map(|_| SlotEntry {
                segment: OnceLock::new(),
            })
            .collect();
        let pool = Self {
            namespace,
            ring_capacity,
            entries,
            allocated: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            metrics,
        };
        for id in 0..warm_pool_size.min(max_slots) {
            pool.ensure_segment(id as u32)?;
        }
        tracing::info!(
            warm = warm_pool_size,
            max = max_slots,
            ring_capacity,
            "slot pool initialized"
        );
        Ok(pool)
    }

    pub fn max_slots(&self) -> usize {
        self.entries.len()
    }

    pub fn ring_capacity(&self) -> u32 {
        self.ring_capacity
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The segment for `slot_id`, if it has been created.
    pub fn segment(&self, slot_id: u32) -> Option<Arc<SlotSegment>> {
        self.entries.get(slot_id as usize)?.segment.get().cloned()
    }

    /// Ids of every created slot.
    pub fn allocated_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.segment.get().is_some())
            .map(|(id, _)| id as u32)
    }

    fn ensure_segment(&self, slot_id: u32) -> Result<Arc<SlotSegment>, TransportError> {
        let entry = self
            .entries
            .get(slot_id as usize)
            .ok_or(PoolError::InvalidSlot(slot_id))?;
        if let Some(segment) = entry.segment.get() {
            return Ok(segment.clone());
        }

        let _guard = self.grow_lock.lock();
        if let Some(segment) = entry.segment.get() {
            return Ok(segment.clone());
        }
        let segment = Arc::new(SlotSegment::create(
            &self.namespace.segment_path(slot_id),
            slot_id,
            self.ring_capacity,
        )?);
        let _ = entry.segment.set(segment.clone());
        let allocated = self.allocated.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.slot_grown();
        tracing::debug!(slot_id, allocated, "slot segment allocated");
        Ok(segment)
    }

    fn claim_segment(&self, segment: Arc<SlotSegment>) -> Result<SlotClaim, PoolError> {
        let slot_id = segment.slot_id();
        let generation = segment
            .header()
            .meta
            .claim(clock::monotonic_ns())
            .map_err(|e| PoolError::NotFree {
                slot_id,
                state: e.actual,
            })?;
        self.metrics.slot_claimed();
        tracing::trace!(slot_id, generation, "slot claimed");
        Ok(SlotClaim {
            slot_id,
            generation,
            segment,
        })
    }

    /// Claim any free slot, growing the pool by one if none is free.
    pub fn claim(&self) -> Result<SlotClaim, TransportError> {
        loop {
            for entry in self.entries.iter() {
                if let Some(segment) = entry.segment.get()
                    && let Ok(claim) = self.claim_segment(segment.clone())
                {
                    return Ok(claim);
                }
            }

            let next = {
                let _guard = self.grow_lock.lock();
                self.entries
                    .iter()
                    .position(|e| e.segment.get().is_none())
            };
            let Some(id) = next else {
                self.metrics.slot_exhausted();
                tracing::warn!(max_slots = self.max_slots(), "slot pool exhausted");
                return Err(PoolError::Exhausted {
                    max_slots: self.max_slots(),
                }
                .into());
            };
            // Losing the new slot to a concurrent claimer just means scanning again.
            let segment = self.ensure_segment(id as u32)?;
            if let Ok(claim) = self.claim_segment(segment) {
                return Ok(claim);
            }
        }
    }

    /// Claim the specific slot a client asked for, creating it if needed.
    pub fn claim_id(&self, slot_id: u32) -> Result<SlotClaim, TransportError> {
        let segment = self.ensure_segment(slot_id)?;
        Ok(self.claim_segment(segment)?)
    }

    /// Stamp the client identity into a claimed slot and mark it `Active`.
    pub fn activate(
        &self,
        claim: &SlotClaim,
        client_pid: u32,
        nonce: u64,
    ) -> Result<(), PoolError> {
        let header = claim.segment.header();
        self.check_generation(claim.slot_id, claim.generation)?;
        claim
            .segment
            .reset_rings()
            .map_err(|_| PoolError::InvalidSlot(claim.slot_id))?;
        header.clear_connection();
        header
            .server_pid
            .store(std::process::id(), Ordering::Release);
        header.client_pid.store(client_pid, Ordering::Release);
        header.meta.last_activity.store(clock::monotonic_ns(), Ordering::SeqCst);
        // Nonce last: the client treats "Active with my nonce" as accepted.
        header.claim_nonce.store(nonce, Ordering::Release);
        header
            .meta
            .try_transition(SlotState::Claimed, SlotState::Active)
            .map_err(|e| PoolError::NotFree {
                slot_id: claim.slot_id,
                state: e.actual,
            })
    }

    fn check_generation(&self, slot_id: u32, expected: u32) -> Result<(), PoolError> {
        let segment = self.segment(slot_id).ok_or(PoolError::InvalidSlot(slot_id))?;
        let found = segment.header().meta.generation();
        if found != expected {
            return Err(PoolError::StaleGeneration {
                slot_id,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Reset a slot and return it to `Free`, removing the lock file of the
    /// connection it served.
    ///
    /// With `generation` set, only an `Active` slot still carrying that
    /// generation is released, so a stale handle cannot free a reused slot.
    /// Without it, a `Claimed` slot is released too; only its claimer may
    /// do that.
    pub fn release(&self, slot_id: u32, generation: Option<u32>) -> Result<(), PoolError> {
        let segment = self.segment(slot_id).ok_or(PoolError::InvalidSlot(slot_id))?;
        if let Some(expected) = generation {
            self.check_generation(slot_id, expected)?;
        }
        self.release_segment(&segment, generation)
    }

    fn release_segment(
        &self,
        segment: &SlotSegment,
        generation: Option<u32>,
    ) -> Result<(), PoolError> {
        let slot_id = segment.slot_id();
        let header = segment.header();
        let Some(from) = begin_release(&header.meta, generation.is_none()) else {
            // Already free, not yet active, or someone else is reclaiming it.
            return Ok(());
        };
        if let Some(expected) = generation {
            // The slot may have been released and re-activated between the
            // check and the CAS; hand it back untouched.
            let found = header.meta.generation();
            if found != expected {
                let _ = header.meta.try_transition(SlotState::Reclaimable, from);
                return Err(PoolError::StaleGeneration {
                    slot_id,
                    expected,
                    found,
                });
            }
        }
        // Closed flags stay set so a departing peer can tell a close from a
        // reclaim; activation clears them.
        let nonce = header.claim_nonce.swap(0, Ordering::AcqRel);
        segment
            .reset_rings()
            .map_err(|_| PoolError::InvalidSlot(slot_id))?;
        if nonce != 0
            && let Err(e) = lockfile::remove_if_owned(&self.namespace.lock_path(slot_id), nonce)
        {
            tracing::warn!(slot_id, %e, "failed to remove lock of released slot");
        }
        header.meta.release().map_err(|e| PoolError::NotFree {
            slot_id,
            state: e.actual,
        })?;
        self.metrics.slot_released();
        tracing::trace!(slot_id, "slot released");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            allocated: self.allocated.load(Ordering::Acquire),
            max_slots: self.max_slots(),
            ..PoolStats::default()
        };
        for id in self.allocated_ids() {
            let Some(segment) = self.segment(id) else {
                continue;
            };
            match segment.header().meta.state() {
                Some(SlotState::Free) => stats.free += 1,
                Some(SlotState::Claimed) => stats.claimed += 1,
                Some(SlotState::Active) => stats.active += 1,
                Some(SlotState::Reclaimable) | None => stats.reclaimable += 1,
            }
        }
        stats
    }
}

/// CAS an `Active` (or, with `claimed`, a `Claimed`) slot to `Reclaimable`.
///
/// Returns the state it left, or `None` if there was nothing to release;
/// exactly one caller wins the right to reset a slot.
fn begin_release(meta: &SlotMeta, claimed: bool) -> Option<SlotState> {
    loop {
        let from = match meta.state() {
            Some(SlotState::Active) => SlotState::Active,
            Some(SlotState::Claimed) if claimed => SlotState::Claimed,
            _ => return None,
        };
        if meta.try_transition(from, SlotState::Reclaimable).is_ok() {
            return Some(from);
        }
    }
}
