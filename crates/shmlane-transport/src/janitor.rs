//! Crash recovery.
//!
//! Two passes:
//!
//! - [`Janitor::startup_sweep`] runs once before a listener builds its pool.
//!   It removes namespace directories left by earlier boots, lock files that
//!   are too old or whose owner is gone, and segments with no lock.
//! - [`Janitor::sweep_slots`] runs periodically. It reclaims slots whose
//!   client died, slots idle past the TTL, and slots marked unusable after
//!   ring corruption.
//!
//! An idle reclaim races with a live connection's activity stamp. The
//! connection stores its stamp and then checks the state; the janitor CASes
//! `Active -> Reclaimable` and then re-reads the stamp, backing out if it
//! moved. One of the two always sees the other.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use shm_primitives::{ReclaimAttempt, SlotState};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock;
use crate::error::TransportError;
use crate::lockfile;
use crate::metrics::TransportMetrics;
use crate::namespace::Namespace;
use crate::pool::SlotPool;
use crate::security;
use crate::segment::SlotSegment;

/// Why a slot was reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReclaimReason {
    /// No send or receive within the slot TTL.
    IdleTimeout,
    /// The client process no longer exists.
    PeerGone,
    /// The slot was marked unusable, usually after ring corruption.
    Corrupted,
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::PeerGone => write!(f, "peer gone"),
            Self::Corrupted => write!(f, "corrupted"),
        }
    }
}

/// What a startup sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_boot_dirs: usize,
    pub stale_locks: usize,
    pub orphan_segments: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Janitor {
    pool: Arc<SlotPool>,
    lock_max_age: Duration,
    slot_ttl: Duration,
    metrics: Arc<TransportMetrics>,
    /// Slots seen `Reclaimable` last sweep, with their generation. A slot is
    /// only treated as corrupted once it stays that way across two sweeps.
    suspects: Mutex<Vec<(u32, u32)>>,
}

impl Janitor {
    pub fn new(
        pool: Arc<SlotPool>,
        lock_max_age: Duration,
        slot_ttl: Duration,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            pool,
            lock_max_age,
            slot_ttl,
            metrics,
            suspects: Mutex::new(Vec::new()),
        }
    }

    /// Clean up after a previous run. Running it twice changes nothing more.
    pub fn startup_sweep(
        namespace: &Namespace,
        lock_max_age: Duration,
        metrics: &TransportMetrics,
    ) -> Result<SweepReport, TransportError> {
        let mut report = SweepReport::default();

        for dir in namespace.stale_boot_dirs() {
            if let Err(e) = security::validate_owned(&dir) {
                metrics.security_violation();
                tracing::error!(
                    path = %dir.display(),
                    %e,
                    "not purging foreign namespace directory"
                );
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    report.stale_boot_dirs += 1;
                    tracing::info!(path = %dir.display(), "purged namespace from a previous boot");
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), %e, "failed to purge stale namespace")
                }
            }
        }

        for (slot_id, path) in list(namespace.locks_dir(), lockfile::parse_lock_name)? {
            if let Some(reason) = stale_lock(&path, lock_max_age, metrics)
                && remove_file(&path)
            {
                report.stale_locks += 1;
                metrics.stale_lock_removed();
                tracing::debug!(slot_id, reason, "removed stale lock");
            }
        }

        for (slot_id, path) in list(namespace.segments_dir(), parse_segment_name)? {
            if namespace.lock_path(slot_id).exists() {
                continue;
            }
            if let Err(e) = security::validate_owned(&path) {
                metrics.security_violation();
                tracing::error!(slot_id, %e, "not removing foreign segment");
                continue;
            }
            if remove_file(&path) {
                report.orphan_segments += 1;
                tracing::debug!(slot_id, "removed orphan segment");
            }
        }

        if !report.is_empty() {
            tracing::info!(
                stale_boot_dirs = report.stale_boot_dirs,
                stale_locks = report.stale_locks,
                orphan_segments = report.orphan_segments,
                "startup sweep finished"
            );
        }
        Ok(report)
    }

    /// Reclaim dead, idle and corrupted slots. Returns what was reclaimed.
    pub fn sweep_slots(&self) -> Vec<(u32, ReclaimReason)> {
        let idle_before = clock::monotonic_ns().saturating_sub(self.slot_ttl.as_nanos() as u64);
        let mut reclaimed = Vec::new();
        let mut suspects = self.suspects.lock();
        let previous = std::mem::take(&mut *suspects);

        for slot_id in self.pool.allocated_ids().collect::<Vec<_>>() {
            let Some(segment) = self.pool.segment(slot_id) else {
                continue;
            };
            let header = segment.header();
            let reason = match header.meta.state() {
                Some(SlotState::Active) => {
                    let client_pid = header.client_pid.load(Ordering::Acquire);
                    if header.is_server_closed() && header.is_client_closed() {
                        // Closed on both ends; an ordinary release.
                        if let Err(e) = self.pool.release(slot_id, Some(header.meta.generation())) {
                            tracing::debug!(slot_id, %e, "closed slot changed hands");
                        }
                        None
                    } else if !header.is_client_closed() && !security::pid_alive(client_pid) {
                        // A client that closed cleanly left requests for the
                        // server to drain; only a crash is reclaimed here.
                        header
                            .meta
                            .try_transition(SlotState::Active, SlotState::Reclaimable)
                            .is_ok()
                            .then_some(ReclaimReason::PeerGone)
                    } else {
                        match header.meta.try_begin_reclaim(idle_before) {
                            ReclaimAttempt::Reclaiming => Some(ReclaimReason::IdleTimeout),
                            ReclaimAttempt::Fresh => {
                                tracing::trace!(slot_id, "reclaim backed out, slot is fresh");
                                None
                            }
                            ReclaimAttempt::NotActive(_) => None,
                        }
                    }
                }
                Some(SlotState::Reclaimable) | None => {
                    let generation = header.meta.generation();
                    if previous.contains(&(slot_id, generation)) {
                        header.meta.force_reclaimable();
                        Some(ReclaimReason::Corrupted)
                    } else {
                        suspects.push((slot_id, generation));
                        None
                    }
                }
                Some(SlotState::Free) | Some(SlotState::Claimed) => None,
            };

            if let Some(reason) = reason {
                self.reclaim(&segment, reason);
                reclaimed.push((slot_id, reason));
            }
        }
        drop(suspects);

        self.sweep_locks();
        reclaimed
    }

    /// Reset a slot this janitor moved to `Reclaimable` and free it.
    fn reclaim(&self, segment: &SlotSegment, reason: ReclaimReason) {
        let slot_id = segment.slot_id();
        let header = segment.header();
        let nonce = header.claim_nonce.swap(0, Ordering::AcqRel);
        if let Err(e) = segment.reset_rings() {
            tracing::error!(slot_id, %e, "cannot reset rings of reclaimed slot");
        }
        let lock_path = self.pool.namespace().lock_path(slot_id);
        if nonce != 0
            && let Err(e) = lockfile::remove_if_owned(&lock_path, nonce)
        {
            tracing::warn!(slot_id, %e, "failed to remove lock of reclaimed slot");
        }
        match header.meta.release() {
            Ok(()) => {
                self.metrics.slot_reclaimed(reason);
                tracing::info!(slot_id, %reason, "slot reclaimed");
            }
            Err(e) => tracing::debug!(slot_id, %e, "slot changed hands during reclaim"),
        }
    }

    /// Remove lock files that are too old or whose owner is gone, unless
    /// they belong to the active connection on their slot.
    pub fn sweep_locks(&self) -> usize {
        let namespace = self.pool.namespace();
        let locks = match list(namespace.locks_dir(), lockfile::parse_lock_name) {
            Ok(locks) => locks,
            Err(e) => {
                tracing::warn!(%e, "cannot list lock directory");
                return 0;
            }
        };

        let mut removed = 0;
        for (slot_id, path) in locks {
            if let Some(segment) = self.pool.segment(slot_id)
                && segment.header().meta.state() == Some(SlotState::Active)
                && let Ok(Some(record)) = lockfile::read(&path)
                && record.nonce == segment.header().nonce()
            {
                continue;
            }
            if let Some(reason) = stale_lock(&path, self.lock_max_age, &self.metrics)
                && remove_file(&path)
            {
                removed += 1;
                self.metrics.stale_lock_removed();
                tracing::debug!(slot_id, reason, "removed stale lock");
            }
        }
        removed
    }

    /// Run [`sweep_slots`](Self::sweep_slots) every `interval` until aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the startup sweep covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reclaimed = self.sweep_slots();
                if !reclaimed.is_empty() {
                    tracing::debug!(count = reclaimed.len(), "janitor sweep reclaimed slots");
                }
            }
        })
    }
}

/// Why the lock at `path` is stale, or `None` if it should stay.
fn stale_lock(path: &Path, max_age: Duration, metrics: &TransportMetrics) -> Option<&'static str> {
    if let Err(e) = security::validate_owned(path) {
        metrics.security_violation();
        tracing::error!(path = %path.display(), %e, "ignoring foreign lock file");
        return None;
    }
    match lockfile::read(path) {
        Ok(Some(record)) if record.age() > max_age => Some("expired"),
        Ok(Some(record)) if !security::pid_alive(record.pid) => Some("owner exited"),
        Ok(Some(_)) => None,
        // Still being written, unless it has been that way for too long.
        Ok(None) => {
            let age = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            (age > max_age).then_some("unreadable")
        }
        Err(_) => None,
    }
}

fn parse_segment_name(name: &str) -> Option<u32> {
    name.strip_prefix("slot-")?
        .strip_suffix(".seg")?
        .parse()
        .ok()
}

/// Entries of `dir` whose names `parse` accepts. A missing directory is empty.
fn list(
    dir: &Path,
    parse: fn(&str) -> Option<u32>,
) -> io::Result<Vec<(u32, std::path::PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out: Vec<_> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let id = parse(entry.file_name().to_str()?)?;
            Some((id, entry.path()))
        })
        .collect();
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
}

fn remove_file(path: &Path) -> bool {
    match lockfile::remove(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "failed to remove file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::lockfile::LockRecord;
    use crate::namespace::Address;
    use crate::testing::dead_pid;
    use std::path::PathBuf;

    fn config(name: &str) -> TransportConfig {
        let base = std::env::temp_dir()
            .join(format!("shmlane_janitor_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        TransportConfig {
            base_path: base,
            ..TransportConfig::default()
        }
    }

    fn namespace(config: &TransportConfig, boot: &str) -> Namespace {
        let ns = Namespace::resolve(&Address::new("jan").with_boot(boot), config).unwrap();
        ns.create_dirs().unwrap();
        ns
    }

    fn janitor(ns: Namespace, ttl: Duration) -> (Janitor, Arc<SlotPool>) {
        let metrics = TransportMetrics::new();
        let pool = Arc::new(SlotPool::initialize(ns, 4096, 2, 4, metrics.clone()).unwrap());
        (
            Janitor::new(pool.clone(), Duration::from_secs(60), ttl, metrics),
            pool,
        )
    }

    #[test]
    fn startup_sweep_is_idempotent() {
        let config = config("startup");
        let ns = namespace(&config, "aaaaaaaa");
        let old_boot = namespace(&config, "bbbbbbbb");
        let metrics = TransportMetrics::new();

        // Dead owner, expired, and live fresh locks.
        let dead = LockRecord {
            pid: dead_pid(),
            ..LockRecord::for_current_process()
        };
        lockfile::create(&ns.lock_path(0), &dead).unwrap();
        let expired = LockRecord {
            created_ns: 1,
            ..LockRecord::for_current_process()
        };
        lockfile::create(&ns.lock_path(1), &expired).unwrap();
        lockfile::create(&ns.lock_path(2), &LockRecord::for_current_process()).unwrap();

        // Segment 2 has a live lock; segment 3 has none.
        SlotSegment::create(&ns.segment_path(2), 2, 4096).unwrap();
        SlotSegment::create(&ns.segment_path(3), 3, 4096).unwrap();

        let first = Janitor::startup_sweep(&ns, Duration::from_secs(60), &metrics).unwrap();
        assert_eq!(
            first,
            SweepReport {
                stale_boot_dirs: 1,
                stale_locks: 2,
                orphan_segments: 1,
            }
        );
        assert!(!old_boot.root().exists());
        assert!(ns.lock_path(2).exists());
        assert!(ns.segment_path(2).exists());
        assert!(!ns.segment_path(3).exists());

        let listing = |dir: &Path| -> Vec<PathBuf> {
            let mut v: Vec<_> = fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
            v.sort();
            v
        };
        let before = (listing(ns.locks_dir()), listing(ns.segments_dir()));
        let second = Janitor::startup_sweep(&ns, Duration::from_secs(60), &metrics).unwrap();
        assert!(second.is_empty());
        assert_eq!(before, (listing(ns.locks_dir()), listing(ns.segments_dir())));
        assert_eq!(metrics.snapshot().stale_locks_removed, 2);

        fs::remove_dir_all(&config.base_path).ok();
    }

    #[test]
    fn reclaims_slot_of_dead_client() {
        let config = config("dead");
        let ns = namespace(&config, "aaaaaaaa");
        let (janitor, pool) = janitor(ns, Duration::from_secs(300));

        let claim = pool.claim().unwrap();
        let record = LockRecord {
            pid: dead_pid(),
            ..LockRecord::for_current_process()
        };
        let lock_path = pool.namespace().lock_path(claim.slot_id);
        lockfile::create(&lock_path, &record).unwrap();
        pool.activate(&claim, record.pid, record.nonce).unwrap();

        assert_eq!(
            janitor.sweep_slots(),
            vec![(claim.slot_id, ReclaimReason::PeerGone)]
        );
        assert_eq!(claim.segment.header().meta.state(), Some(SlotState::Free));
        assert!(!lock_path.exists());
        assert_eq!(janitor.metrics.snapshot().reclaimed_peer_gone, 1);

        fs::remove_dir_all(&config.base_path).ok();
    }

    #[test]
    fn releases_slot_closed_on_both_ends() {
        let config = config("closed");
        let ns = namespace(&config, "aaaaaaaa");
        let (janitor, pool) = janitor(ns, Duration::from_secs(300));

        let claim = pool.claim().unwrap();
        pool.activate(&claim, std::process::id(), 9).unwrap();
        let header = claim.segment.header();
        header.server_closed.store(1, Ordering::SeqCst);
        assert!(janitor.sweep_slots().is_empty());
        assert_eq!(header.meta.state(), Some(SlotState::Active));

        header.client_closed.store(1, Ordering::SeqCst);
        assert!(janitor.sweep_slots().is_empty());
        assert_eq!(header.meta.state(), Some(SlotState::Free));
        assert_eq!(janitor.metrics.snapshot().reclaimed_total(), 0);

        fs::remove_dir_all(&config.base_path).ok();
    }

    #[test]
    fn idle_slot_is_reclaimed_fresh_slot_is_not() {
        let config = config("idle");
        let ns = namespace(&config, "aaaaaaaa");
        let (janitor, pool) = janitor(ns, Duration::from_millis(20));

        let idle = pool.claim().unwrap();
        pool.activate(&idle, std::process::id(), 11).unwrap();
        let fresh = pool.claim().unwrap();
        pool.activate(&fresh, std::process::id(), 12).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(fresh.segment.header().meta.touch(clock::monotonic_ns()));

        assert_eq!(
            janitor.sweep_slots(),
            vec![(idle.slot_id, ReclaimReason::IdleTimeout)]
        );
        assert_eq!(fresh.segment.header().meta.state(), Some(SlotState::Active));
        assert_eq!(idle.segment.header().meta.state(), Some(SlotState::Free));

        fs::remove_dir_all(&config.base_path).ok();
    }

    #[test]
    fn corrupted_slot_is_reclaimed_on_second_sweep() {
        let config = config("corrupt");
        let ns = namespace(&config, "aaaaaaaa");
        let (janitor, pool) = janitor(ns, Duration::from_secs(300));

        let claim = pool.claim().unwrap();
        pool.activate(&claim, std::process::id(), 5).unwrap();
        claim.segment.header().meta.force_reclaimable();

        assert!(janitor.sweep_slots().is_empty());
        assert_eq!(
            janitor.sweep_slots(),
            vec![(claim.slot_id, ReclaimReason::Corrupted)]
        );
        assert_eq!(pool.stats().free, 2);

        fs::remove_dir_all(&config.base_path).ok();
    }

    #[test]
    fn closed_slot_is_released_with_its_lock() {
        let config = config("closed");
        let ns = namespace(&config, "aaaaaaaa");
        let (janitor, pool) = janitor(ns, Duration::from_secs(300));

        let claim = pool.claim().unwrap();
        let record = LockRecord::for_current_process();
        let lock_path = pool.namespace().lock_path(claim.slot_id);
        lockfile::create(&lock_path, &record).unwrap();
        pool.activate(&claim, record.pid, record.nonce).unwrap();
        let header = claim.segment.header();
        header.server_closed.store(1, Ordering::SeqCst);
        header.client_closed.store(1, Ordering::SeqCst);

        assert!(janitor.sweep_slots().is_empty());
        assert_eq!(header.meta.state(), Some(SlotState::Free));
        assert!(!lock_path.exists());

        fs::remove_dir_all(&config.base_path).ok();
    }

    #[test]
    fn active_lock_survives_lock_sweep() {
        let config = config("locks");
        let ns = namespace(&config, "aaaaaaaa");
        let (janitor, pool) = janitor(ns, Duration::from_secs(300));

        let claim = pool.claim().unwrap();
        let record = LockRecord {
            created_ns: 1,
            ..LockRecord::for_current_process()
        };
        let active_lock = pool.namespace().lock_path(claim.slot_id);
        lockfile::create(&active_lock, &record).unwrap();
        pool.activate(&claim, record.pid, record.nonce).unwrap();

        let orphan = pool.namespace().lock_path(3);
        lockfile::create(
            &orphan,
            &LockRecord {
                pid: dead_pid(),
                ..LockRecord::for_current_process()
            },
        )
        .unwrap();

        assert_eq!(janitor.sweep_locks(), 1);
        assert!(active_lock.exists());
        assert!(!orphan.exists());

        fs::remove_dir_all(&config.base_path).ok();
    }
}
