//! Networking metrics
//!
//! A plain metrics value threaded through constructors instead of a global
//! registry. Components hold an `Arc<Metrics>` and update it at explicit call
//! sites; an external observability collaborator reads the snapshots. The
//! default value doubles as the no-op instance for tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters and gauges exposed by the networking core.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Number of connected peers.
    pub peers: AtomicI64,
    /// Total bytes of message payload sent to peers.
    pub peer_send_bytes_total: AtomicU64,
    /// Total bytes of message payload received from peers.
    pub peer_receive_bytes_total: AtomicU64,
    /// Messages dropped from queues under pressure.
    pub queue_dropped_msgs: AtomicU64,
    /// Inbound connections rejected by the IP filter.
    pub filtered_connections: AtomicU64,
    /// Inbound connections rejected by the admission tracker.
    pub rejected_connections: AtomicU64,
    /// Envelopes received for channels nobody registered.
    pub unknown_channel_msgs: AtomicU64,
}

impl Metrics {
    pub fn peers_up(&self) {
        self.peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peers_down(&self) {
        self.peers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_sent_bytes(&self, n: usize) {
        self.peer_send_bytes_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_received_bytes(&self, n: usize) {
        self.peer_receive_bytes_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_dropped_msgs(&self, n: u64) {
        self.queue_dropped_msgs.fetch_add(n, Ordering::Relaxed);
    }

    pub fn filtered_connection(&self) {
        self.filtered_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_connection(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_channel_msg(&self) {
        self.unknown_channel_msgs.fetch_add(1, Ordering::Relaxed);
    }
}
