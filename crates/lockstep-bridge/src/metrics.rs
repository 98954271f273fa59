use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a bridge over its lifetime.
#[derive(Default)]
pub struct BridgeMetrics {
    pub enqueued: AtomicU64,
    pub sent: AtomicU64,
    pub queue_full_waits: AtomicU64,
    pub inbound_accepted: AtomicU64,
    pub inbound_dropped: AtomicU64,
    pub protocol_anomalies: AtomicU64,
    pub entries_discarded: AtomicU64,
    /// "Still waiting" warnings emitted by blocked receives.
    pub receive_alerts: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeMetricsSnapshot {
    pub enqueued: u64,
    pub sent: u64,
    pub queue_full_waits: u64,
    pub inbound_accepted: u64,
    pub inbound_dropped: u64,
    pub protocol_anomalies: u64,
    pub entries_discarded: u64,
    pub receive_alerts: u64,
}

impl BridgeMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeMetricsSnapshot {
        BridgeMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            queue_full_waits: self.queue_full_waits.load(Ordering::Relaxed),
            inbound_accepted: self.inbound_accepted.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            protocol_anomalies: self.protocol_anomalies.load(Ordering::Relaxed),
            entries_discarded: self.entries_discarded.load(Ordering::Relaxed),
            receive_alerts: self.receive_alerts.load(Ordering::Relaxed),
        }
    }
}
