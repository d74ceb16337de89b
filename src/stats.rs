//! In-process traffic counters shared by every component of one connector.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct Stats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    retransmissions: AtomicU64,
    expirations: AtomicU64,
    checksum_failures: AtomicU64,
    dropped: AtomicU64,
    resets_sent: AtomicU64,
    resets_received: AtomicU64,
    connections_opened: AtomicU64,
    connections_accepted: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub expirations: u64,
    pub checksum_failures: u64,
    /// Datagrams discarded because a queue was full or closed.
    pub dropped: u64,
    pub resets_sent: u64,
    pub resets_received: u64,
    pub connections_opened: u64,
    pub connections_accepted: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub fn record_sent(&self, bytes: usize) {
        bump(&self.packets_sent);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        bump(&self.packets_received);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        bump(&self.retransmissions);
    }

    pub fn record_expiration(&self) {
        bump(&self.expirations);
    }

    pub fn record_checksum_failure(&self) {
        bump(&self.checksum_failures);
    }

    pub fn record_dropped(&self) {
        bump(&self.dropped);
    }

    pub fn record_reset_sent(&self) {
        bump(&self.resets_sent);
    }

    pub fn record_reset_received(&self) {
        bump(&self.resets_received);
    }

    pub fn record_connection_opened(&self) {
        bump(&self.connections_opened);
    }

    pub fn record_connection_accepted(&self) {
        bump(&self.connections_accepted);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_sent: get(&self.packets_sent),
            bytes_sent: get(&self.bytes_sent),
            packets_received: get(&self.packets_received),
            bytes_received: get(&self.bytes_received),
            retransmissions: get(&self.retransmissions),
            expirations: get(&self.expirations),
            checksum_failures: get(&self.checksum_failures),
            dropped: get(&self.dropped),
            resets_sent: get(&self.resets_sent),
            resets_received: get(&self.resets_received),
            connections_opened: get(&self.connections_opened),
            connections_accepted: get(&self.connections_accepted),
        }
    }
}
