//! Byte-level connection over one claimed slot.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use shm_primitives::{ByteConsumer, ByteProducer, RingError, SlotState, WriteResult};

use crate::clock;
use crate::config::BackoffConfig;
use crate::error::{ConnectionError, DisconnectReason};
use crate::lockfile;
use crate::metrics::TransportMetrics;
use crate::pool::{SlotClaim, SlotPool};
use crate::security;
use crate::segment::SlotSegment;

/// How often sends and empty receives re-check that the peer process exists.
const PID_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on the bytes returned by a single [`Connection::receive`].
const READ_CAP: usize = 64 * 1024;

/// How long to wait out a janitor's reclaim attempt that is about to revert.
const RECLAIM_SETTLE_SPINS: u32 = 1000;

/// Which end of the slot a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reads requests, writes responses.
    Server,
    /// Writes requests, reads responses.
    Client,
}

/// One end of a slot.
///
/// Owns exactly one producer and one consumer, so both ring directions stay
/// single-producer/single-consumer. Sending may suspend during backoff;
/// receiving never blocks.
pub struct Connection {
    role: Role,
    slot_id: u32,
    generation: u32,
    nonce: u64,
    peer_pid: u32,
    segment: Arc<SlotSegment>,
    producer: ByteProducer,
    consumer: ByteConsumer,
    backoff: BackoffConfig,
    lock_path: PathBuf,
    pool: Option<Arc<SlotPool>>,
    metrics: Arc<TransportMetrics>,
    created_at: Instant,
    last_pid_check: Instant,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("slot_id", &self.slot_id)
            .field("generation", &self.generation)
            .field("peer_pid", &self.peer_pid)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    /// Server end of an activated claim.
    pub(crate) fn server(
        claim: SlotClaim,
        nonce: u64,
        client_pid: u32,
        lock_path: PathBuf,
        pool: Arc<SlotPool>,
        backoff: BackoffConfig,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self, RingError> {
        let (producer, consumer) = claim.segment.server_ends()?;
        metrics.connection_opened();
        let now = Instant::now();
        Ok(Self {
            role: Role::Server,
            slot_id: claim.slot_id,
            generation: claim.generation,
            nonce,
            peer_pid: client_pid,
            segment: claim.segment,
            producer,
            consumer,
            backoff,
            lock_path,
            pool: Some(pool),
            metrics,
            created_at: now,
            last_pid_check: now,
            closed: false,
        })
    }

    /// Client end of a segment the listener has activated with `nonce`.
    pub(crate) fn client(
        segment: Arc<SlotSegment>,
        nonce: u64,
        lock_path: PathBuf,
        backoff: BackoffConfig,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self, RingError> {
        let (producer, consumer) = segment.client_ends()?;
        let header = segment.header();
        let now = Instant::now();
        metrics.connection_opened();
        Ok(Self {
            role: Role::Client,
            slot_id: segment.slot_id(),
            generation: header.meta.generation(),
            nonce,
            peer_pid: header.server_pid.load(Ordering::Acquire),
            segment,
            producer,
            consumer,
            backoff,
            lock_path,
            pool: None,
            metrics,
            created_at: now,
            last_pid_check: now,
            closed: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn peer_pid(&self) -> u32 {
        self.peer_pid
    }

    /// Ring capacity in each direction; the largest single write.
    pub fn capacity(&self) -> u32 {
        self.producer.capacity()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Write all of `bytes` to the outbound ring, backing off while it is full.
    ///
    /// Dropping the returned future mid-backoff leaves nothing written.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.check_peer()?;
        let capacity = self.producer.capacity();
        if bytes.len() > capacity as usize {
            return Err(ConnectionError::TooLarge {
                len: bytes.len(),
                capacity,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            self.touch()?;
            match self.producer.try_write(bytes) {
                Ok(WriteResult::Written(n)) => {
                    self.metrics
                        .record_send(n, started.elapsed(), self.producer.occupancy());
                    return Ok(());
                }
                Ok(WriteResult::WouldBlock) => {
                    if attempts >= self.backoff.max_attempts {
                        let waited = started.elapsed();
                        self.metrics.backpressure_timeout();
                        tracing::warn!(
                            slot_id = self.slot_id,
                            attempts,
                            ?waited,
                            len = bytes.len(),
                            "send timed out against a full ring"
                        );
                        return Err(ConnectionError::BackpressureTimeout { attempts, waited });
                    }
                    self.metrics.backpressure();
                    let delay = self.backoff.delay(attempts);
                    attempts += 1;
                    tracing::trace!(
                        slot_id = self.slot_id,
                        attempts,
                        ?delay,
                        "ring full, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    self.check_peer()?;
                }
                Err(RingError::TooLarge { len, capacity }) => {
                    return Err(ConnectionError::TooLarge { len, capacity });
                }
                Err(e) => return Err(self.corrupted(e)),
            }
        }
    }

    /// One non-blocking write attempt of all of `bytes`.
    pub fn try_send(&mut self, bytes: &[u8]) -> Result<WriteResult, ConnectionError> {
        self.check_peer()?;
        let capacity = self.producer.capacity();
        if bytes.len() > capacity as usize {
            return Err(ConnectionError::TooLarge {
                len: bytes.len(),
                capacity,
            });
        }
        self.touch()?;
        match self.producer.try_write(bytes) {
            Ok(WriteResult::Written(n)) => {
                self.metrics
                    .record_send(n, Duration::ZERO, self.producer.occupancy());
                Ok(WriteResult::Written(n))
            }
            Ok(WriteResult::WouldBlock) => {
                self.metrics.backpressure();
                Ok(WriteResult::WouldBlock)
            }
            Err(RingError::TooLarge { len, capacity }) => {
                Err(ConnectionError::TooLarge { len, capacity })
            }
            Err(e) => Err(self.corrupted(e)),
        }
    }

    /// Read whatever is buffered, up to an internal cap. Never blocks.
    ///
    /// Returns `Ok(None)` when nothing is buffered and the peer is still
    /// there; `Disconnected` only once the ring is drained and the peer is gone.
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        self.check_slot()?;
        let max = READ_CAP.min(self.consumer.capacity() as usize);
        match self.consumer.try_read(max) {
            Ok(Some(bytes)) => {
                self.after_read(bytes.len())?;
                Ok(Some(bytes))
            }
            Ok(None) => {
                self.check_peer()?;
                Ok(None)
            }
            Err(e) => Err(self.corrupted(e)),
        }
    }

    /// Like [`receive`](Self::receive), reading into `buf`.
    pub fn receive_into(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ConnectionError> {
        self.check_slot()?;
        match self.consumer.try_read_into(buf) {
            Ok(Some(n)) => {
                self.after_read(n)?;
                Ok(Some(n))
            }
            Ok(None) => {
                self.check_peer()?;
                Ok(None)
            }
            Err(e) => Err(self.corrupted(e)),
        }
    }

    fn after_read(&mut self, n: usize) -> Result<(), ConnectionError> {
        // A failed touch means the slot was reclaimed and the bytes may come
        // from a reset ring.
        self.touch()?;
        self.metrics.record_receive(n);
        Ok(())
    }

    /// Stamp activity; pairs with the janitor's CAS-then-recheck.
    fn touch(&mut self) -> Result<(), ConnectionError> {
        if self.segment.header().meta.touch(clock::monotonic_ns()) {
            return Ok(());
        }
        self.check_slot()
    }

    /// Is the slot still ours and active?
    fn check_slot(&self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let header = self.segment.header();
        if header.nonce() != self.nonce || header.meta.generation() != self.generation {
            let peer_closed = match self.role {
                Role::Server => header.is_client_closed(),
                Role::Client => header.is_server_closed(),
            };
            let reason = if peer_closed {
                DisconnectReason::PeerClosed
            } else {
                DisconnectReason::SlotReclaimed
            };
            return Err(ConnectionError::Disconnected(reason));
        }

        let mut spins = 0;
        loop {
            match header.meta.state() {
                Some(SlotState::Active) => return Ok(()),
                // A janitor saw us idle and is re-checking activity; it
                // reverts to Active if our stamp is fresh.
                Some(SlotState::Reclaimable) if spins < RECLAIM_SETTLE_SPINS => {
                    spins += 1;
                    std::hint::spin_loop();
                }
                _ => return Err(ConnectionError::Disconnected(DisconnectReason::SlotReclaimed)),
            }
        }
    }

    /// Full liveness check: slot ownership, the peer's closed flag, and at
    /// most once per [`PID_CHECK_INTERVAL`] whether the peer process exists.
    fn check_peer(&mut self) -> Result<(), ConnectionError> {
        self.check_slot()?;
        let header = self.segment.header();
        let peer_closed = match self.role {
            Role::Server => header.is_client_closed(),
            Role::Client => header.is_server_closed(),
        };
        if peer_closed {
            return Err(ConnectionError::Disconnected(DisconnectReason::PeerClosed));
        }
        if self.last_pid_check.elapsed() >= PID_CHECK_INTERVAL {
            self.last_pid_check = Instant::now();
            if !security::pid_alive(self.peer_pid) {
                return Err(ConnectionError::Disconnected(DisconnectReason::PeerExited {
                    pid: self.peer_pid,
                }));
            }
        }
        Ok(())
    }

    /// Report ring corruption and hand the slot to the janitor, unless the
    /// slot already moved on to another connection.
    fn corrupted(&mut self, err: RingError) -> ConnectionError {
        let header = self.segment.header();
        let ours = header.nonce() == self.nonce && header.meta.generation() == self.generation;
        if !ours {
            // Cursors reset under us; nothing of ours is left to corrupt.
            return ConnectionError::Disconnected(DisconnectReason::SlotReclaimed);
        }
        tracing::error!(
            slot_id = self.slot_id,
            role = ?self.role,
            %err,
            "ring corruption detected"
        );
        if header
            .meta
            .try_transition(SlotState::Active, SlotState::Reclaimable)
            .is_ok()
        {
            tracing::warn!(slot_id = self.slot_id, "slot marked reclaimable");
        }
        ConnectionError::SlotCorrupted(err)
    }

    /// Close this side. Idempotent.
    ///
    /// The lock file marks the slot id as taken until the slot is free again.
    /// A client leaving first keeps it so the server can drain; the server's
    /// release removes it. Otherwise the slot goes back to the pool at the
    /// next accept on its id or janitor sweep.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let header = self.segment.header();
        let ours = header.nonce() == self.nonce && header.meta.generation() == self.generation;
        let mut remove_lock = !ours;
        if ours {
            match self.role {
                Role::Client => {
                    header.client_closed.store(1, Ordering::SeqCst);
                    remove_lock = header.server_closed.load(Ordering::SeqCst) != 0
                        || !security::pid_alive(self.peer_pid);
                }
                Role::Server => {
                    header.server_closed.store(1, Ordering::SeqCst);
                    // Unread responses stay readable until the client is done.
                    let client_done = header.client_closed.load(Ordering::SeqCst) != 0
                        || !security::pid_alive(self.peer_pid);
                    if client_done {
                        remove_lock = true;
                        if let Some(pool) = &self.pool
                            && let Err(e) = pool.release(self.slot_id, Some(self.generation))
                        {
                            tracing::debug!(slot_id = self.slot_id, %e, "slot already released");
                        }
                    }
                }
            }
        }
        if remove_lock
            && let Err(e) = lockfile::remove_if_owned(&self.lock_path, self.nonce)
        {
            tracing::warn!(
                slot_id = self.slot_id,
                path = %self.lock_path.display(),
                %e,
                "failed to remove lock file"
            );
        }

        self.metrics.connection_closed();
        tracing::debug!(
            slot_id = self.slot_id,
            role = ?self.role,
            lifetime = ?self.created_at.elapsed(),
            "connection closed"
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
