#![doc = include_str!("../README.md")]

use shmlane_transport::Listener;

pub use bytes::Bytes;
pub use shmlane_codec::{
    ErrorCode, ErrorPayload, FrameError, FrameFlags, MAX_PAYLOAD_LEN, MessageType, TypeRegistry,
};
pub use shmlane_transport::{
    Address, BackoffConfig, ChecksumPolicy, Connection, ConnectionError, DisconnectReason,
    Incoming, Message, MessageStream, MetricsSnapshot, PoolError, PoolStats, ReclaimReason,
    SendOptions, SweepReport, TransportConfig, TransportConfigBuilder, TransportError,
    TransportMetrics, UnknownTypePolicy, security,
};

/// Lower layers, for callers that want raw byte connections or their own codec.
pub use shmlane_codec as codec;
pub use shmlane_transport as transport;

/// Listening side of an address.
#[derive(Debug)]
pub struct Server {
    listener: Listener,
}

/// Start listening on `address`.
///
/// Must be called from within a tokio runtime; the accept loop and the
/// janitor run as tasks on it.
pub async fn listen(address: &Address, config: TransportConfig) -> Result<Server, TransportError> {
    let listener = Listener::bind(address, config).await?;
    let report = listener.startup_report();
    if !report.is_empty() {
        tracing::info!(
            stale_boot_dirs = report.stale_boot_dirs,
            stale_locks = report.stale_locks,
            orphan_segments = report.orphan_segments,
            "cleaned up after earlier runs"
        );
    }
    Ok(Server { listener })
}

/// Connect to the server listening on `address`.
pub async fn connect(
    address: &Address,
    config: &TransportConfig,
) -> Result<MessageStream, TransportError> {
    let conn = shmlane_transport::connect(address, config).await?;
    Ok(MessageStream::new(conn, config))
}

impl Server {
    /// Wait for the next client.
    pub async fn accept(&mut self) -> Result<MessageStream, TransportError> {
        let conn = self.listener.accept().await?;
        Ok(MessageStream::new(conn, self.listener.config()))
    }

    /// Stop accepting. Streams already accepted stay usable.
    pub fn shutdown(&mut self) {
        self.listener.shutdown();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.listener.metrics().snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.listener.pool().stats()
    }

    pub fn startup_report(&self) -> SweepReport {
        self.listener.startup_report()
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }
}

pub mod prelude {
    pub use crate::{
        Address, Incoming, Message, MessageStream, MessageType, SendOptions, Server,
        TransportConfig, TransportError,
    };
}
