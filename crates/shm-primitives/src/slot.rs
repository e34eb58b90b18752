//! Slot ownership state machine.
//!
//! Every slot moves through `Free -> Claimed -> Active -> Reclaimable -> Free`.
//! All transitions are single CAS operations, so two racing parties can never
//! both win the same transition.

use core::fmt;

use crate::sync::{AtomicU32, AtomicU64, Ordering};

/// Slot lifecycle state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No owner; may be claimed.
    Free = 0,
    /// Claimed by the server for a pending client, not yet serving traffic.
    Claimed = 1,
    /// Connection established; both rings in use.
    Active = 2,
    /// Marked for reclamation; no new activity is accepted.
    Reclaimable = 3,
}

impl SlotState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Claimed),
            2 => Some(Self::Active),
            3 => Some(Self::Reclaimable),
            _ => None,
        }
    }
}

/// Shared slot metadata (16 bytes).
#[repr(C)]
pub struct SlotMeta {
    pub state: AtomicU32,
    /// Bumped on every claim; lets observers detect slot reuse.
    pub generation: AtomicU32,
    /// Last activity timestamp, in the owner's clock units.
    pub last_activity: AtomicU64,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SlotMeta>() == 16);

/// A CAS-based transition did not happen because the state was not `expected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub expected: SlotState,
    /// Raw observed value; may be out of range if the segment is corrupt.
    pub actual: u32,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match SlotState::from_u32(self.actual) {
            Some(actual) => {
                write!(f, "expected slot state {:?}, found {:?}", self.expected, actual)
            }
            None => write!(
                f,
                "expected slot state {:?}, found invalid value {}",
                self.expected, self.actual
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransitionError {}

/// Result of [`SlotMeta::try_begin_reclaim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimAttempt {
    /// The slot is now `Reclaimable`; the caller owns the cleanup.
    Reclaiming,
    /// Activity newer than the cutoff was observed; the slot stays `Active`.
    Fresh,
    /// The slot was not `Active`.
    NotActive(TransitionError),
}

impl SlotMeta {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(SlotState::Free as u32),
            generation: AtomicU32::new(0),
            last_activity: AtomicU64::new(0),
        }
    }

    /// Current state, or `None` if the raw value is out of range.
    #[inline]
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub fn try_transition(&self, from: SlotState, to: SlotState) -> Result<(), TransitionError> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| TransitionError {
                expected: from,
                actual,
            })
    }

    /// `Free -> Claimed`, bumping the generation. Returns the new generation.
    pub fn claim(&self, now: u64) -> Result<u32, TransitionError> {
        self.try_transition(SlotState::Free, SlotState::Claimed)?;
        self.last_activity.store(now, Ordering::SeqCst);
        Ok(self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1))
    }

    /// Record activity at `now`.
    ///
    /// Returns `false` if the slot is no longer `Active`, in which case the
    /// caller must treat its connection as gone. The store precedes the state
    /// check, so a reclaimer either sees this activity or this call sees the
    /// reclaim; both cannot miss each other.
    pub fn touch(&self, now: u64) -> bool {
        self.last_activity.store(now, Ordering::SeqCst);
        self.state.load(Ordering::SeqCst) == SlotState::Active as u32
    }

    /// Try `Active -> Reclaimable` for a slot idle since before `idle_before`.
    ///
    /// After winning the CAS the activity timestamp is re-read. If a
    /// concurrent [`SlotMeta::touch`] slipped in, the slot is moved back to
    /// `Active` and [`ReclaimAttempt::Fresh`] is returned.
    pub fn try_begin_reclaim(&self, idle_before: u64) -> ReclaimAttempt {
        if self.last_activity.load(Ordering::SeqCst) >= idle_before {
            return ReclaimAttempt::Fresh;
        }
        if let Err(err) = self.try_transition(SlotState::Active, SlotState::Reclaimable) {
            return ReclaimAttempt::NotActive(err);
        }
        if self.last_activity.load(Ordering::SeqCst) >= idle_before {
            // Only the reclaimer moves a slot out of Reclaimable, so this cannot fail.
            let _ = self.try_transition(SlotState::Reclaimable, SlotState::Active);
            return ReclaimAttempt::Fresh;
        }
        ReclaimAttempt::Reclaiming
    }

    /// Force `Reclaimable` regardless of the current state.
    ///
    /// Used when a slot is known to be unusable (peer gone, corrupted rings).
    /// Returns the previous raw state.
    pub fn force_reclaimable(&self) -> u32 {
        self.state
            .swap(SlotState::Reclaimable as u32, Ordering::SeqCst)
    }

    /// Return a reclaimed slot to the pool.
    pub fn release(&self) -> Result<(), TransitionError> {
        self.try_transition(SlotState::Reclaimable, SlotState::Free)
    }
}

impl Default for SlotMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn active(now: u64) -> SlotMeta {
        let meta = SlotMeta::new();
        meta.claim(now).unwrap();
        meta.try_transition(SlotState::Claimed, SlotState::Active)
            .unwrap();
        meta
    }

    #[test]
    fn claim_bumps_generation() {
        let meta = SlotMeta::new();
        assert_eq!(meta.claim(1), Ok(1));
        assert_eq!(meta.claim(2).unwrap_err().actual, SlotState::Claimed as u32);

        meta.try_transition(SlotState::Claimed, SlotState::Reclaimable)
            .unwrap();
        meta.release().unwrap();
        assert_eq!(meta.claim(3), Ok(2));
    }

    #[test]
    fn touch_reports_inactive_slot() {
        let meta = active(10);
        assert!(meta.touch(11));
        meta.force_reclaimable();
        assert!(!meta.touch(12));
    }

    #[test]
    fn reclaim_skips_fresh_slots() {
        let meta = active(100);
        assert_eq!(meta.try_begin_reclaim(50), ReclaimAttempt::Fresh);
        assert_eq!(meta.state(), Some(SlotState::Active));

        assert_eq!(meta.try_begin_reclaim(200), ReclaimAttempt::Reclaiming);
        assert_eq!(meta.state(), Some(SlotState::Reclaimable));
        assert!(matches!(
            meta.try_begin_reclaim(300),
            ReclaimAttempt::NotActive(_)
        ));
    }

    #[test]
    fn invalid_state_is_reported() {
        let meta = SlotMeta::new();
        meta.state.store(77, Ordering::SeqCst);
        assert_eq!(meta.state(), None);
        let err = meta.claim(0).unwrap_err();
        assert_eq!(err.actual, 77);
        assert!(err.to_string().contains("invalid value 77"));
    }
}
