//! Fixtures shared by unit tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackoffConfig, TransportConfig};
use crate::connection::Connection;
use crate::lockfile::{self, LockRecord};
use crate::metrics::TransportMetrics;
use crate::namespace::{Address, Namespace};
use crate::pool::SlotPool;

/// A pool in a private temp directory, removed on drop.
pub(crate) struct Fixture {
    pub pool: Arc<SlotPool>,
    pub base: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

pub(crate) fn fixture(name: &str) -> Fixture {
    let base = std::env::temp_dir().join(format!("shmlane_fx_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&base);
    std::fs::create_dir_all(&base).unwrap();
    let config = TransportConfig {
        base_path: base.clone(),
        ..TransportConfig::default()
    };
    let ns = Namespace::resolve(&Address::new("fx"), &config).unwrap();
    ns.create_dirs().unwrap();
    let pool = SlotPool::initialize(ns, 4096, 1, 2, TransportMetrics::new()).unwrap();
    Fixture {
        pool: Arc::new(pool),
        base,
    }
}

impl Fixture {
    /// A connected server/client pair inside this process.
    pub fn pair(&self, backoff: BackoffConfig) -> (Connection, Connection) {
        let record = LockRecord::for_current_process();
        let claim = self.pool.claim().unwrap();
        let lock_path = self.pool.namespace().lock_path(claim.slot_id);
        lockfile::create(&lock_path, &record).unwrap();
        self.pool.activate(&claim, record.pid, record.nonce).unwrap();
        let segment = claim.segment.clone();
        let metrics = TransportMetrics::new();
        let server = Connection::server(
            claim,
            record.nonce,
            record.pid,
            lock_path.clone(),
            self.pool.clone(),
            backoff,
            metrics.clone(),
        )
        .unwrap();
        let client =
            Connection::client(segment, record.nonce, lock_path, backoff, metrics).unwrap();
        (server, client)
    }
}

pub(crate) fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(2),
        max_attempts: 3,
    }
}

/// Pid of a child that has already been reaped.
pub(crate) fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}
