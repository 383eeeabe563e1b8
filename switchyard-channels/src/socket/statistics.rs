//! Socket statistics tracking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the socket actor.
#[derive(Debug, Default)]
pub(crate) struct SocketStatistics {
    pub(super) frames_sent: AtomicU64,
    pub(super) frames_received: AtomicU64,
    pub(super) decode_failures: AtomicU64,
    pub(super) unroutable: AtomicU64,
    pub(super) stale_discarded: AtomicU64,
    pub(super) reconnect_attempts: AtomicU64,
    pub(super) connections_established: AtomicU64,
    pub(super) heartbeats_sent: AtomicU64,
    pub(super) heartbeat_timeouts: AtomicU64,
}

impl SocketStatistics {
    pub(super) fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub(super) fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Socket counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsSnapshot {
    /// Frames handed to the transport
    pub frames_sent: u64,
    /// Frames received from the transport
    pub frames_received: u64,
    /// Inbound frames dropped because they could not be decoded
    pub decode_failures: u64,
    /// Inbound envelopes dropped because no channel has their topic
    pub unroutable: u64,
    /// Inbound envelopes dropped because their `join_ref` is outdated
    pub stale_discarded: u64,
    /// Automatic reconnect attempts started
    pub reconnect_attempts: u64,
    /// Successful connection opens
    pub connections_established: u64,
    /// Heartbeats sent
    pub heartbeats_sent: u64,
    /// Connections dropped for lack of inbound traffic
    pub heartbeat_timeouts: u64,
}
