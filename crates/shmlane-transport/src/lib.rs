//! Shared-memory transport for shmlane.
//!
//! A listening process owns a pool of *slots*. Each slot is one file-backed
//! shared-memory segment holding a small header and two SPSC byte rings
//! (client -> server requests, server -> client responses).
//!
//! Connecting works through the filesystem: a client creates
//! `locks/slot-<id>.lock` for a candidate slot id, the listener notices the
//! lock, claims the slot with a CAS on its state and stamps the client's
//! nonce into the header. The client sees its nonce, and both sides now
//! hold a [`Connection`].
//!
//! ```text
//! <base>/shmlane-u<euid>-<session>-b<boot8>/
//!     listener.lock
//!     locks/slot-0.lock      24 bytes: pid, reserved, nonce, created_ns
//!     segments/slot-0.seg    SlotHeader + request ring + response ring
//! ```
//!
//! The [`Janitor`] reclaims slots and lock files left behind by crashed or
//! hung peers; the [`security`] module keeps every path private to the
//! effective user.

mod client;
mod clock;
mod config;
mod connection;
mod error;
mod framed;
mod janitor;
mod layout;
mod listener;
mod lockfile;
mod metrics;
mod namespace;
mod pool;
mod segment;
#[cfg(test)]
mod testing;

pub mod security;

pub use client::{connect, connect_with_metrics};
pub use config::{
    BackoffConfig, ChecksumPolicy, ConfigError, TransportConfig, TransportConfigBuilder,
    UnknownTypePolicy,
};
pub use connection::{Connection, Role};
pub use error::{ConnectionError, DisconnectReason, PoolError, TransportError};
pub use framed::{Incoming, Message, MessageStream, SendOptions};
pub use janitor::{Janitor, ReclaimReason, SweepReport};
pub use layout::{LayoutError, SLOT_HEADER_SIZE, SLOT_MAGIC, SlotHeader};
pub use listener::Listener;
pub use lockfile::LockRecord;
pub use metrics::{Histogram, HistogramSnapshot, MetricsSnapshot, TransportMetrics};
pub use namespace::{Address, Namespace};
pub use pool::{PoolStats, SlotClaim, SlotPool};
pub use security::SecurityError;
pub use segment::SlotSegment;

pub use shmlane_codec as codec;
