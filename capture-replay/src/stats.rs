use std::sync::atomic::{AtomicU64, Ordering};

/// Delivery counters shared by every client connection.
#[derive(Debug, Default)]
pub struct ReplayStats {
    connections_accepted: AtomicU64,
    active_clients: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    faults: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub active_clients: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub faults: u64,
}

impl ReplayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        // Never drops below zero
        let _ = self
            .active_clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_delivery(&self, packets: u64, bytes: u64) {
        self.packets_sent.fetch_add(packets, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_clients: self.active_clients.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}
