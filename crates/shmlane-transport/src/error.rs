use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use shm_primitives::RingError;
use shmlane_codec::FrameError;

use crate::config::ConfigError;
use crate::layout::LayoutError;
use crate::security::SecurityError;

/// Why a connection ended from the point of view of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side.
    PeerClosed,
    /// The peer process no longer exists.
    PeerExited { pid: u32 },
    /// The slot was reclaimed or reassigned under this connection.
    SlotReclaimed,
    /// The peer sent a DISCONNECT frame.
    RemoteDisconnect,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::PeerExited { pid } => write!(f, "peer process {pid} exited"),
            Self::SlotReclaimed => write!(f, "slot was reclaimed"),
            Self::RemoteDisconnect => write!(f, "peer sent disconnect"),
        }
    }
}

/// Errors from byte-level [`Connection`](crate::Connection) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    Disconnected(DisconnectReason),
    /// This side already closed the connection.
    Closed,
    /// A single write can never fit in the ring.
    TooLarge { len: usize, capacity: u32 },
    /// The ring stayed full for the whole backoff budget.
    BackpressureTimeout { attempts: u32, waited: Duration },
    /// Ring cursors are inconsistent; the slot is unusable.
    SlotCorrupted(RingError),
}

impl ConnectionError {
    /// Errors after which the connection can never be used again.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::BackpressureTimeout { .. } | Self::TooLarge { .. })
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(reason) => write!(f, "disconnected: {reason}"),
            Self::Closed => write!(f, "connection closed"),
            Self::TooLarge { len, capacity } => {
                write!(f, "write of {len} bytes exceeds ring capacity {capacity}")
            }
            Self::BackpressureTimeout { attempts, waited } => write!(
                f,
                "ring stayed full after {attempts} attempts over {waited:?}"
            ),
            Self::SlotCorrupted(e) => write!(f, "slot corrupted: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SlotCorrupted(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from [`SlotPool`](crate::SlotPool) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot up to `max_slots` is in use.
    Exhausted { max_slots: usize },
    /// Slot id outside `0..max_slots`.
    InvalidSlot(u32),
    /// The slot is not in the state the operation needs.
    NotFree { slot_id: u32, state: u32 },
    /// The slot was reused since the caller's claim.
    StaleGeneration { slot_id: u32, expected: u32, found: u32 },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { max_slots } => write!(f, "all {max_slots} slots are in use"),
            Self::InvalidSlot(id) => write!(f, "slot id {id} out of range"),
            Self::NotFree { slot_id, state } => {
                write!(f, "slot {slot_id} is not free (state {state})")
            }
            Self::StaleGeneration {
                slot_id,
                expected,
                found,
            } => write!(
                f,
                "slot {slot_id} generation changed: expected {expected}, found {found}"
            ),
        }
    }
}

impl std::error::Error for PoolError {}

/// Umbrella error for transport operations.
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Config(ConfigError),
    Security(SecurityError),
    Layout(LayoutError),
    Ring(RingError),
    Pool(PoolError),
    Connection(ConnectionError),
    Frame(FrameError),
    /// No listener namespace exists at this address.
    NoListener { path: PathBuf },
    /// Another live listener already serves this address.
    AddressInUse { pid: u32 },
    /// The listener did not answer a connection request in time.
    ConnectTimeout { slot_id: u32, waited: Duration },
    /// The peer sent a message type this side does not accept.
    UnrecognizedType { msg_type: u16, message_id: u64 },
    /// The listener shut down.
    ListenerClosed,
}

impl TransportError {
    /// The disconnect reason, if this error means the peer is gone.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            Self::Connection(ConnectionError::Disconnected(reason)) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Security(e) => write!(f, "security error: {e}"),
            Self::Layout(e) => write!(f, "layout error: {e}"),
            Self::Ring(e) => write!(f, "ring error: {e}"),
            Self::Pool(e) => write!(f, "pool error: {e}"),
            Self::Connection(e) => write!(f, "{e}"),
            Self::Frame(e) => write!(f, "frame error: {e}"),
            Self::NoListener { path } => write!(f, "no listener at {}", path.display()),
            Self::AddressInUse { pid } => write!(f, "address in use by process {pid}"),
            Self::ConnectTimeout { slot_id, waited } => write!(
                f,
                "listener did not accept slot {slot_id} within {waited:?}"
            ),
            Self::UnrecognizedType {
                msg_type,
                message_id,
            } => write!(
                f,
                "unrecognized message type {msg_type:#06x} in message {message_id}"
            ),
            Self::ListenerClosed => write!(f, "listener closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Security(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Ring(e) => Some(e),
            Self::Pool(e) => Some(e),
            Self::Connection(e) => Some(e),
            Self::Frame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for TransportError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<SecurityError> for TransportError {
    fn from(e: SecurityError) -> Self {
        Self::Security(e)
    }
}

impl From<LayoutError> for TransportError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<RingError> for TransportError {
    fn from(e: RingError) -> Self {
        Self::Ring(e)
    }
}

impl From<PoolError> for TransportError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

impl From<ConnectionError> for TransportError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}
