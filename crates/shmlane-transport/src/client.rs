//! Client side of the rendezvous: claim a slot id with a lock file and wait
//! for the listener to activate it.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{PoolError, TransportError};
use crate::lockfile::{self, LockRecord};
use crate::metrics::TransportMetrics;
use crate::namespace::{Address, Namespace};
use crate::security;
use crate::segment::SlotSegment;
use shm_primitives::SlotState;

/// Connect to the listener at `address`.
pub async fn connect(
    address: &Address,
    config: &TransportConfig,
) -> Result<Connection, TransportError> {
    connect_with_metrics(address, config, TransportMetrics::new()).await
}

/// [`connect`], recording into an existing metrics registry.
pub async fn connect_with_metrics(
    address: &Address,
    config: &TransportConfig,
    metrics: Arc<TransportMetrics>,
) -> Result<Connection, TransportError> {
    config.validate()?;
    let namespace = Namespace::resolve(address, config)?;
    namespace.check_existing()?;
    let listener_pid = live_listener(&namespace)?;

    let record = LockRecord::for_current_process();
    let (slot_id, mut lock) = match claim_lock(&namespace, config.max_slots, &record) {
        Ok(claimed) => claimed,
        Err(e) => {
            metrics.connection_rejected();
            return Err(e);
        }
    };
    tracing::debug!(slot_id, nonce = record.nonce, "waiting for listener");

    let started = Instant::now();
    let segment_path = namespace.segment_path(slot_id);
    let mut current: Option<(Arc<SlotSegment>, u64)> = None;
    let segment = loop {
        // The listener may recreate the file; follow the inode.
        match std::fs::metadata(&segment_path) {
            Ok(meta) if current.as_ref().map(|(_, ino)| *ino) != Some(meta.ino()) => {
                match SlotSegment::open(&segment_path, slot_id) {
                    Ok(segment) => current = Some((Arc::new(segment), meta.ino())),
                    Err(TransportError::Security(e)) if e.is_tamper() => {
                        metrics.security_violation();
                        return Err(e.into());
                    }
                    // Half-initialized segment; look again next round.
                    Err(e) => tracing::trace!(slot_id, %e, "segment not ready"),
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some((segment, _)) = &current {
            let header = segment.header();
            if header.meta.state() == Some(SlotState::Active) && header.nonce() == record.nonce {
                break segment.clone();
            }
        }

        let waited = started.elapsed();
        if waited >= config.connect_timeout {
            metrics.connection_rejected();
            tracing::warn!(slot_id, ?waited, "connect timed out");
            return Err(TransportError::ConnectTimeout { slot_id, waited });
        }
        if !security::pid_alive(listener_pid) {
            return Err(TransportError::NoListener {
                path: namespace.root().to_path_buf(),
            });
        }
        tokio::time::sleep(config.accept_poll_interval).await;
    };

    let conn = Connection::client(
        segment,
        record.nonce,
        lock.path.clone(),
        config.backoff,
        metrics,
    )?;
    lock.disarm();
    tracing::debug!(slot_id, waited = ?started.elapsed(), "connected");
    Ok(conn)
}

/// Pid of the listener, if one is alive.
fn live_listener(namespace: &Namespace) -> Result<u32, TransportError> {
    let path = namespace.listener_lock_path();
    let no_listener = || TransportError::NoListener {
        path: namespace.root().to_path_buf(),
    };
    match lockfile::read(&path) {
        Ok(Some(record)) if security::pid_alive(record.pid) => {
            security::validate_owned(&path)?;
            Ok(record.pid)
        }
        Ok(_) => Err(no_listener()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(no_listener()),
        Err(e) => Err(e.into()),
    }
}

/// Create the first free `slot-<id>.lock`. Exactly one process wins each id.
fn claim_lock(
    namespace: &Namespace,
    max_slots: usize,
    record: &LockRecord,
) -> Result<(u32, LockGuard), TransportError> {
    for slot_id in 0..max_slots as u32 {
        let path = namespace.lock_path(slot_id);
        match lockfile::create(&path, record) {
            Ok(()) => {
                return Ok((
                    slot_id,
                    LockGuard {
                        path,
                        nonce: record.nonce,
                        armed: true,
                    },
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(PoolError::Exhausted { max_slots }.into())
}

/// Removes our lock file unless the connection took it over.
struct LockGuard {
    path: PathBuf,
    nonce: u64,
    armed: bool,
}

impl LockGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = lockfile::remove_if_owned(&self.path, self.nonce);
        }
    }
}
