//! Transport metrics.
//!
//! Every counter is an independent relaxed atomic. A snapshot is therefore
//! not a consistent cut across counters, which is fine for observability.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::janitor::ReclaimReason;

const BUCKETS: usize = 24;

/// Latency histogram with power-of-two microsecond buckets.
///
/// Bucket `i` counts samples below `2^i` µs; the last bucket takes everything
/// larger.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let index = (u64::BITS - us.leading_zeros()) as usize;
        self.buckets[index.min(BUCKETS - 1)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub buckets: [u64; BUCKETS],
    pub count: u64,
    pub sum_us: u64,
}

impl HistogramSnapshot {
    pub fn mean_us(&self) -> u64 {
        self.sum_us.checked_div(self.count).unwrap_or(0)
    }

    /// Upper bound (µs) of the bucket holding quantile `q` in `0.0..=1.0`.
    pub fn quantile_upper_us(&self, q: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let target = ((self.count as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= target {
                return 1u64 << i;
            }
        }
        1u64 << (BUCKETS - 1)
    }
}

/// Counters and histograms for one listener or client.
#[derive(Debug)]
pub struct TransportMetrics {
    enabled: AtomicBool,

    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_rejected: AtomicU64,

    pub slots_claimed: AtomicU64,
    pub slots_released: AtomicU64,
    pub slots_grown: AtomicU64,
    pub slots_exhausted: AtomicU64,
    pub reclaimed_idle: AtomicU64,
    pub reclaimed_peer_gone: AtomicU64,
    pub reclaimed_corrupted: AtomicU64,
    pub stale_locks_removed: AtomicU64,

    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,

    pub backpressure_events: AtomicU64,
    pub backpressure_timeouts: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub unrecognized_types: AtomicU64,
    pub security_violations: AtomicU64,

    /// Highest ring occupancy observed on send, in per-mille.
    pub occupancy_high_water: AtomicU64,

    pub send_latency: Histogram,
    pub accept_latency: Histogram,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            slots_claimed: AtomicU64::new(0),
            slots_released: AtomicU64::new(0),
            slots_grown: AtomicU64::new(0),
            slots_exhausted: AtomicU64::new(0),
            reclaimed_idle: AtomicU64::new(0),
            reclaimed_peer_gone: AtomicU64::new(0),
            reclaimed_corrupted: AtomicU64::new(0),
            stale_locks_removed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            backpressure_timeouts: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            unrecognized_types: AtomicU64::new(0),
            security_violations: AtomicU64::new(0),
            occupancy_high_water: AtomicU64::new(0),
            send_latency: Histogram::default(),
            accept_latency: Histogram::default(),
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TransportMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Disabled metrics skip latency recording; counters keep counting.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        bump(&self.connections_opened);
    }

    pub fn connection_closed(&self) {
        bump(&self.connections_closed);
    }

    pub fn connection_rejected(&self) {
        bump(&self.connections_rejected);
    }

    pub fn slot_claimed(&self) {
        bump(&self.slots_claimed);
    }

    pub fn slot_released(&self) {
        bump(&self.slots_released);
    }

    pub fn slot_grown(&self) {
        bump(&self.slots_grown);
    }

    pub fn slot_exhausted(&self) {
        bump(&self.slots_exhausted);
    }

    pub fn slot_reclaimed(&self, reason: ReclaimReason) {
        match reason {
            ReclaimReason::IdleTimeout => bump(&self.reclaimed_idle),
            ReclaimReason::PeerGone => bump(&self.reclaimed_peer_gone),
            ReclaimReason::Corrupted => bump(&self.reclaimed_corrupted),
        }
    }

    pub fn stale_lock_removed(&self) {
        bump(&self.stale_locks_removed);
    }

    pub fn record_send(&self, bytes: usize, elapsed: Duration, occupancy: f64) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        let per_mille = (occupancy.clamp(0.0, 1.0) * 1000.0) as u64;
        self.occupancy_high_water
            .fetch_max(per_mille, Ordering::Relaxed);
        if self.is_enabled() {
            self.send_latency.record(elapsed);
        }
    }

    pub fn record_receive(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        bump(&self.frames_sent);
    }

    pub fn frame_received(&self) {
        bump(&self.frames_received);
    }

    pub fn record_accept(&self, elapsed: Duration) {
        if self.is_enabled() {
            self.accept_latency.record(elapsed);
        }
    }

    pub fn backpressure(&self) {
        bump(&self.backpressure_events);
    }

    pub fn backpressure_timeout(&self) {
        bump(&self.backpressure_timeouts);
    }

    pub fn protocol_error(&self) {
        bump(&self.protocol_errors);
    }

    pub fn checksum_failure(&self) {
        bump(&self.checksum_failures);
    }

    pub fn unrecognized_type(&self) {
        bump(&self.unrecognized_types);
    }

    pub fn security_violation(&self) {
        bump(&self.security_violations);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_opened: load(&self.connections_opened),
            connections_closed: load(&self.connections_closed),
            connections_rejected: load(&self.connections_rejected),
            slots_claimed: load(&self.slots_claimed),
            slots_released: load(&self.slots_released),
            slots_grown: load(&self.slots_grown),
            slots_exhausted: load(&self.slots_exhausted),
            reclaimed_idle: load(&self.reclaimed_idle),
            reclaimed_peer_gone: load(&self.reclaimed_peer_gone),
            reclaimed_corrupted: load(&self.reclaimed_corrupted),
            stale_locks_removed: load(&self.stale_locks_removed),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            frames_sent: load(&self.frames_sent),
            frames_received: load(&self.frames_received),
            backpressure_events: load(&self.backpressure_events),
            backpressure_timeouts: load(&self.backpressure_timeouts),
            protocol_errors: load(&self.protocol_errors),
            checksum_failures: load(&self.checksum_failures),
            unrecognized_types: load(&self.unrecognized_types),
            security_violations: load(&self.security_violations),
            occupancy_high_water: load(&self.occupancy_high_water),
            send_latency: self.send_latency.snapshot(),
            accept_latency: self.accept_latency.snapshot(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.connections_opened,
            &self.connections_closed,
            &self.connections_rejected,
            &self.slots_claimed,
            &self.slots_released,
            &self.slots_grown,
            &self.slots_exhausted,
            &self.reclaimed_idle,
            &self.reclaimed_peer_gone,
            &self.reclaimed_corrupted,
            &self.stale_locks_removed,
            &self.bytes_sent,
            &self.bytes_received,
            &self.frames_sent,
            &self.frames_received,
            &self.backpressure_events,
            &self.backpressure_timeouts,
            &self.protocol_errors,
            &self.checksum_failures,
            &self.unrecognized_types,
            &self.security_violations,
            &self.occupancy_high_water,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.send_latency.reset();
        self.accept_latency.reset();
    }

    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }

    pub fn render_prometheus(&self) -> String {
        self.snapshot().render_prometheus()
    }

    /// Log [`TransportMetrics::summary`] at `info` every `interval` until aborted.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracing::info!(target: "shmlane::metrics", "{}", metrics.summary());
            }
        })
    }
}

/// Point-in-time copy of [`TransportMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub slots_claimed: u64,
    pub slots_released: u64,
    pub slots_grown: u64,
    pub slots_exhausted: u64,
    pub reclaimed_idle: u64,
    pub reclaimed_peer_gone: u64,
    pub reclaimed_corrupted: u64,
    pub stale_locks_removed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub backpressure_events: u64,
    pub backpressure_timeouts: u64,
    pub protocol_errors: u64,
    pub checksum_failures: u64,
    pub unrecognized_types: u64,
    pub security_violations: u64,
    pub occupancy_high_water: u64,
    pub send_latency: HistogramSnapshot,
    pub accept_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    pub fn reclaimed_total(&self) -> u64 {
        self.reclaimed_idle + self.reclaimed_peer_gone + self.reclaimed_corrupted
    }

    pub fn summary(&self) -> String {
        format!(
            "connections: {} opened, {} closed, {} rejected; \
             slots: {} claimed, {} released, {} reclaimed, {} exhausted; \
             frames: {} out, {} in; bytes: {} out, {} in; backpressure: {} events, {} timeouts; \
             errors: {} protocol, {} checksum; send p99 <= {}us",
            self.connections_opened,
            self.connections_closed,
            self.connections_rejected,
            self.slots_claimed,
            self.slots_released,
            self.reclaimed_total(),
            self.slots_exhausted,
            self.frames_sent,
            self.frames_received,
            self.bytes_sent,
            self.bytes_received,
            self.backpressure_events,
            self.backpressure_timeouts,
            self.protocol_errors,
            self.checksum_failures,
            self.send_latency.quantile_upper_us(0.99),
        )
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &str, u64); 21] = [
            ("connections_opened_total", "Connections established", self.connections_opened),
            ("connections_closed_total", "Connections closed", self.connections_closed),
            (
                "connections_rejected_total",
                "Connection requests rejected",
                self.connections_rejected,
            ),
            ("slots_claimed_total", "Slot claims", self.slots_claimed),
            ("slots_released_total", "Slot releases", self.slots_released),
            ("slots_grown_total", "Slots created on demand", self.slots_grown),
            (
                "slots_exhausted_total",
                "Claims refused because the pool was full",
                self.slots_exhausted,
            ),
            ("stale_locks_removed_total", "Stale lock files removed", self.stale_locks_removed),
            ("bytes_sent_total", "Bytes written to rings", self.bytes_sent),
            ("bytes_received_total", "Bytes read from rings", self.bytes_received),
            ("frames_sent_total", "Frames sent", self.frames_sent),
            ("frames_received_total", "Frames received", self.frames_received),
            (
                "backpressure_events_total",
                "Sends that found the ring full",
                self.backpressure_events,
            ),
            (
                "backpressure_timeouts_total",
                "Sends that exhausted their backoff",
                self.backpressure_timeouts,
            ),
            ("protocol_errors_total", "Inbound frames rejected", self.protocol_errors),
            (
                "checksum_failures_total",
                "Inbound frames with a bad checksum",
                self.checksum_failures,
            ),
            (
                "unrecognized_types_total",
                "Inbound frames with an unregistered type",
                self.unrecognized_types,
            ),
            (
                "security_violations_total",
                "Paths refused by ownership checks",
                self.security_violations,
            ),
            ("reclaimed_idle_total", "Slots reclaimed after the idle TTL", self.reclaimed_idle),
            (
                "reclaimed_peer_gone_total",
                "Slots reclaimed after the peer vanished",
                self.reclaimed_peer_gone,
            ),
            (
                "reclaimed_corrupted_total",
                "Slots reclaimed after ring corruption",
                self.reclaimed_corrupted,
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP shmlane_{name} {help}");
            let _ = writeln!(out, "# TYPE shmlane_{name} counter");
            let _ = writeln!(out, "shmlane_{name} {value}");
        }
        let _ = writeln!(
            out,
            "# HELP shmlane_ring_occupancy_high_water Peak ring occupancy in per-mille"
        );
        let _ = writeln!(out, "# TYPE shmlane_ring_occupancy_high_water gauge");
        let _ = writeln!(out, "shmlane_ring_occupancy_high_water {}", self.occupancy_high_water);

        render_histogram(&mut out, "send_latency_us", "Ring write latency", &self.send_latency);
        render_histogram(
            &mut out,
            "accept_latency_us",
            "Lock-to-accept latency",
            &self.accept_latency,
        );
        out
    }
}

fn render_histogram(out: &mut String, name: &str, help: &str, h: &HistogramSnapshot) {
    let _ = writeln!(out, "# HELP shmlane_{name} {help}");
    let _ = writeln!(out, "# TYPE shmlane_{name} histogram");
    let mut cumulative = 0;
    for (i, n) in h.buckets.iter().enumerate().take(BUCKETS - 1) {
        cumulative += n;
        let _ = writeln!(out, "shmlane_{name}_bucket{{le=\"{}\"}} {cumulative}", (1u64 << i) - 1);
    }
    let _ = writeln!(out, "shmlane_{name}_bucket{{le=\"+Inf\"}} {}", h.count);
    let _ = writeln!(out, "shmlane_{name}_sum {}", h.sum_us);
    let _ = writeln!(out, "shmlane_{name}_count {}", h.count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_power_of_two() {
        let h = Histogram::default();
        h.record(Duration::from_micros(0));
        h.record(Duration::from_micros(1));
        h.record(Duration::from_micros(3));
        h.record(Duration::from_micros(1000));
        let snap = h.snapshot();
        assert_eq!(snap.buckets[0], 1);
        assert_eq!(snap.buckets[1], 1);
        assert_eq!(snap.buckets[2], 1);
        assert_eq!(snap.buckets[10], 1);
        assert_eq!(snap.count, 4);
        assert_eq!(snap.sum_us, 1004);
        assert_eq!(snap.mean_us(), 251);
        assert_eq!(snap.quantile_upper_us(0.5), 2);
        assert_eq!(snap.quantile_upper_us(1.0), 1024);
    }

    #[test]
    fn snapshot_reset_and_render() {
        let metrics = TransportMetrics::new();
        metrics.connection_opened();
        metrics.slot_reclaimed(ReclaimReason::PeerGone);
        metrics.record_send(100, Duration::from_micros(5), 0.5);
        metrics.record_send(100, Duration::from_micros(5), 0.25);

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.reclaimed_total(), 1);
        assert_eq!(snap.bytes_sent, 200);
        assert_eq!(snap.occupancy_high_water, 500);
        assert!(snap.summary().contains("1 opened"));

        let text = metrics.render_prometheus();
        assert!(text.contains("shmlane_connections_opened_total 1"));
        assert!(text.contains("shmlane_send_latency_us_count 2"));

        metrics.reset();
        assert_eq!(metrics.snapshot().connections_opened, 0);
        assert_eq!(metrics.snapshot().send_latency.count, 0);
    }

    #[test]
    fn disabled_metrics_skip_latency() {
        let metrics = TransportMetrics::new();
        metrics.set_enabled(false);
        metrics.record_send(10, Duration::from_micros(5), 0.0);
        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.send_latency.count, 0);
    }
}
