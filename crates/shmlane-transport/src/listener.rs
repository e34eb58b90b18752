//! Listener: owns the slot pool and turns client lock files into connections.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{BackoffConfig, TransportConfig};
use crate::connection::Connection;
use crate::error::{PoolError, TransportError};
use crate::janitor::{Janitor, SweepReport};
use crate::lockfile::{self, LockRecord};
use crate::metrics::TransportMetrics;
use crate::namespace::{Address, Namespace};
use crate::pool::SlotPool;
use crate::security::{self, SecurityError};

/// Attempts at replacing a stale listener lock before giving up.
const LISTENER_LOCK_ATTEMPTS: usize = 3;

/// Accepts connections for one address.
///
/// Binding starts two background tasks on the current tokio runtime: the
/// accept loop, which polls the lock directory, and the janitor. Both stop
/// on [`shutdown`](Self::shutdown) or drop.
pub struct Listener {
    namespace: Namespace,
    config: TransportConfig,
    pool: Arc<SlotPool>,
    janitor: Arc<Janitor>,
    metrics: Arc<TransportMetrics>,
    accepted: mpsc::Receiver<Connection>,
    tasks: Vec<JoinHandle<()>>,
    lock_nonce: u64,
    startup_report: SweepReport,
    closed: bool,
}

impl Listener {
    /// Create the namespace, clean up after earlier runs, build the warm pool
    /// and start accepting.
    ///
    /// Fails with [`TransportError::AddressInUse`] while another live process
    /// listens on the same address.
    pub async fn bind(address: &Address, config: TransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let namespace = Namespace::resolve(address, &config)?;
        namespace.create_dirs()?;
        let lock_nonce = claim_listener_lock(&namespace)?;

        let metrics = TransportMetrics::new();
        let bound = Self::start(namespace.clone(), config, metrics, lock_nonce);
        if bound.is_err() {
            let _ = lockfile::remove_if_owned(&namespace.listener_lock_path(), lock_nonce);
        }
        bound
    }

    fn start(
        namespace: Namespace,
        config: TransportConfig,
        metrics: Arc<TransportMetrics>,
        lock_nonce: u64,
    ) -> Result<Self, TransportError> {
        let startup_report = Janitor::startup_sweep(&namespace, config.lock_max_age, &metrics)?;
        let pool = Arc::new(SlotPool::initialize(
            namespace.clone(),
            config.buffer_size,
            config.warm_pool_size,
            config.max_slots,
            metrics.clone(),
        )?);
        let janitor = Arc::new(Janitor::new(
            pool.clone(),
            config.lock_max_age,
            config.slot_ttl,
            metrics.clone(),
        ));

        let (tx, accepted) = mpsc::channel(config.accept_queue_capacity);
        let accept_loop = AcceptLoop {
            pool: pool.clone(),
            tx,
            backoff: config.backoff,
            metrics: metrics.clone(),
            ignored: HashSet::new(),
        };
        let mut tasks = vec![
            tokio::spawn(accept_loop.run(config.accept_poll_interval)),
            janitor.clone().spawn(config.janitor_interval),
        ];
        if let Some(interval) = config.metrics_report_interval {
            tasks.push(metrics.spawn_reporter(interval));
        }

        tracing::info!(
            path = %namespace.root().display(),
            warm = config.warm_pool_size,
            max_slots = config.max_slots,
            buffer_size = config.buffer_size,
            "listening"
        );
        Ok(Self {
            namespace,
            config,
            pool,
            janitor,
            metrics,
            accepted,
            tasks,
            lock_nonce,
            startup_report,
            closed: false,
        })
    }

    /// Wait for the next connection. Unbounded; wrap in a timeout if needed.
    pub async fn accept(&mut self) -> Result<Connection, TransportError> {
        if self.closed {
            return Err(TransportError::ListenerClosed);
        }
        self.accepted
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)
    }

    /// Stop accepting. Connections already handed out keep working.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.accepted.close();
        // Connections nobody accepted are closed on drop.
        while self.accepted.try_recv().is_ok() {}
        if let Err(e) =
            lockfile::remove_if_owned(&self.namespace.listener_lock_path(), self.lock_nonce)
        {
            tracing::warn!(%e, "failed to remove listener lock");
        }
        tracing::info!(path = %self.namespace.root().display(), "listener shut down");
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn janitor(&self) -> &Arc<Janitor> {
        &self.janitor
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// What the startup sweep cleaned up.
    pub fn startup_report(&self) -> SweepReport {
        self.startup_report
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("root", &self.namespace.root())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Take `listener.lock`, replacing it if its owner is gone.
fn claim_listener_lock(namespace: &Namespace) -> Result<u64, TransportError> {
    let path = namespace.listener_lock_path();
    let record = LockRecord::for_current_process();
    for _ in 0..LISTENER_LOCK_ATTEMPTS {
        match lockfile::create(&path, &record) {
            Ok(()) => return Ok(record.nonce),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                security::validate_owned(&path)?;
                match lockfile::read(&path) {
                    Ok(Some(existing)) if security::pid_alive(existing.pid) => {
                        return Err(TransportError::AddressInUse { pid: existing.pid });
                    }
                    Ok(_) => {
                        tracing::info!(path = %path.display(), "replacing stale listener lock");
                        lockfile::remove(&path)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "listener lock keeps reappearing").into())
}

struct AcceptLoop {
    pool: Arc<SlotPool>,
    tx: mpsc::Sender<Connection>,
    backoff: BackoffConfig,
    metrics: Arc<TransportMetrics>,
    /// Lock files (slot id, inode) rejected for good; skipped without logging.
    ignored: HashSet<(u32, u64)>,
}

impl AcceptLoop {
    async fn run(mut self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for (conn, latency) in self.scan() {
                let slot_id = conn.slot_id();
                if self.tx.send(conn).await.is_err() {
                    return;
                }
                self.metrics.record_accept(latency);
                tracing::debug!(slot_id, ?latency, "connection accepted");
            }
            if self.tx.is_closed() {
                return;
            }
        }
    }

    /// One pass over the lock directory.
    fn scan(&mut self) -> Vec<(Connection, Duration)> {
        let locks_dir = self.pool.namespace().locks_dir().to_path_buf();
        let entries = match fs::read_dir(&locks_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %locks_dir.display(), %e, "cannot scan lock directory");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let Some(slot_id) = entry.file_name().to_str().and_then(lockfile::parse_lock_name)
            else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let key = (slot_id, meta.ino());
            seen.insert(key);
            if self.ignored.contains(&key) {
                continue;
            }
            match self.try_accept(slot_id, &entry.path()) {
                Ok(Some(conn)) => accepted.push(conn),
                Ok(None) => {}
                // The slot changed hands mid-accept; look again next tick.
                Err(TransportError::Pool(
                    e @ (PoolError::NotFree { .. } | PoolError::StaleGeneration { .. }),
                )) => {
                    tracing::debug!(slot_id, %e, "slot busy, retrying accept");
                }
                Err(e) => {
                    self.metrics.connection_rejected();
                    if matches!(&e, TransportError::Security(s) if s.is_tamper()) {
                        self.metrics.security_violation();
                    } else {
                        tracing::warn!(slot_id, %e, "rejected connection request");
                    }
                    self.ignored.insert(key);
                }
            }
        }
        self.ignored.retain(|key| seen.contains(key));
        accepted
    }

    /// `Ok(None)` means "nothing to do yet": lock still being written, owner
    /// gone (the janitor's job), already served, or slot busy.
    fn try_accept(
        &self,
        slot_id: u32,
        path: &Path,
    ) -> Result<Option<(Connection, Duration)>, TransportError> {
        if slot_id as usize >= self.pool.max_slots() {
            return Err(PoolError::InvalidSlot(slot_id).into());
        }
        match security::validate_owned(path) {
            Ok(_) => {}
            Err(SecurityError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let record = match lockfile::read(path) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Some(segment) = self.pool.segment(slot_id)
            && segment.header().nonce() == record.nonce
        {
            return Ok(None);
        }
        if !security::pid_alive(record.pid) {
            return Ok(None);
        }

        let claim = match self.pool.claim_id(slot_id) {
            Ok(claim) => claim,
            Err(TransportError::Pool(PoolError::NotFree { .. })) => {
                if !self.release_if_closed(slot_id) {
                    return Ok(None);
                }
                self.pool.claim_id(slot_id)?
            }
            Err(e) => return Err(e),
        };
        let generation = claim.generation;
        if let Err(e) = self.pool.activate(&claim, record.pid, record.nonce) {
            let _ = self.pool.release(slot_id, None);
            return Err(e.into());
        }
        match Connection::server(
            claim,
            record.nonce,
            record.pid,
            path.to_path_buf(),
            self.pool.clone(),
            self.backoff,
            self.metrics.clone(),
        ) {
            Ok(conn) => Ok(Some((conn, record.age()))),
            Err(e) => {
                let _ = self.pool.release(slot_id, Some(generation));
                Err(e.into())
            }
        }
    }

    /// Free a slot both of whose ends have closed, so a new client can use it
    /// before the janitor gets there.
    fn release_if_closed(&self, slot_id: u32) -> bool {
        let Some(segment) = self.pool.segment(slot_id) else {
            return false;
        };
        let header = segment.header();
        if !(header.is_server_closed() && header.is_client_closed()) {
            return false;
        }
        self.pool
            .release(slot_id, Some(header.meta.generation()))
            .is_ok()
    }
}
