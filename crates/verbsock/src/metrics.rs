//! Channel metrics collection.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of channel metrics at a point in time.
pub struct MetricsSnapshot {
    /// Payload bytes accepted by `write`.
    pub bytes_written: u64,
    /// Payload bytes returned by `read`.
    pub bytes_read: u64,
    /// DATA messages handed to the transport.
    pub messages_sent: u64,
    /// DATA messages received into the ring.
    pub messages_received: u64,
    /// FLUSH acknowledgments sent to the peer.
    pub flushes_sent: u64,
    /// FLUSH acknowledgments received from the peer.
    pub flushes_received: u64,
    /// Writes that made no progress because the flow-control latch was set.
    pub write_stalls: u64,
    /// Transport faults observed.
    pub transport_errors: u64,
}

/// Thread-safe per-channel counters.
pub struct ChannelMetrics {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    flushes_sent: AtomicU64,
    flushes_received: AtomicU64,
    write_stalls: AtomicU64,
    transport_errors: AtomicU64,
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ChannelMetrics {
    /// Creates a new ChannelMetrics instance with all counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            flushes_sent: AtomicU64::new(0),
            flushes_received: AtomicU64::new(0),
            write_stalls: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        }
    }

    /// Adds to the bytes written counter.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes read counter.
    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts one DATA message sent.
    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one DATA message received.
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one FLUSH sent.
    pub fn inc_flushes_sent(&self) {
        self.flushes_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one FLUSH received.
    pub fn inc_flushes_received(&self) {
        self.flushes_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one write that stalled on flow control.
    pub fn inc_write_stalls(&self) {
        self.write_stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one transport fault.
    pub fn inc_transport_errors(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            flushes_sent: self.flushes_sent.load(Ordering::Relaxed),
            flushes_received: self.flushes_received.load(Ordering::Relaxed),
            write_stalls: self.write_stalls.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Sums two snapshots, e.g. both ends of a connection.
    pub fn merge(&self, other: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_written: self.bytes_written + other.bytes_written,
            bytes_read: self.bytes_read + other.bytes_read,
            messages_sent: self.messages_sent + other.messages_sent,
            messages_received: self.messages_received + other.messages_received,
            flushes_sent: self.flushes_sent + other.flushes_sent,
            flushes_received: self.flushes_received + other.flushes_received,
            write_stalls: self.write_stalls + other.write_stalls,
            transport_errors: self.transport_errors + other.transport_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_all_zero() {
        let metrics = ChannelMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = ChannelMetrics::new();
        metrics.add_bytes_written(10);
        metrics.add_bytes_written(5);
        metrics.add_bytes_read(7);
        metrics.inc_messages_sent();
        metrics.inc_messages_received();
        metrics.inc_flushes_sent();
        metrics.inc_flushes_received();
        metrics.inc_write_stalls();
        metrics.inc_transport_errors();

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_written, 15);
        assert_eq!(snap.bytes_read, 7);
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.flushes_sent, 1);
        assert_eq!(snap.flushes_received, 1);
        assert_eq!(snap.write_stalls, 1);
        assert_eq!(snap.transport_errors, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ChannelMetrics::new();
        metrics.add_bytes_written(3);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"bytes_written\":3"));
    }

    #[test]
    fn test_merge() {
        let a = MetricsSnapshot {
            bytes_written: 1,
            flushes_sent: 2,
            ..Default::default()
        };
        let b = MetricsSnapshot {
            bytes_written: 4,
            bytes_read: 3,
            ..Default::default()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.bytes_written, 5);
        assert_eq!(merged.bytes_read, 3);
        assert_eq!(merged.flushes_sent, 2);
    }

    #[test]
    fn test_debug_contains_snapshot() {
        let debug = format!("{:?}", ChannelMetrics::new());
        assert!(debug.contains("ChannelMetrics"));
        assert!(debug.contains("snapshot"));
    }
}
