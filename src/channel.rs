//! Logical message channels
//!
//! A channel is a named, prioritized category of application messages,
//! distinct from a network connection. Collaborators (consensus, block sync,
//! mempool, peer exchange) register a [`ChannelDescriptor`] with the router
//! and get back a [`Channel`] handle for sending and receiving
//! [`Envelope`]s. Payloads are opaque bytes; the wire encoding belongs to the
//! collaborator.

use crate::address::NodeId;
use crate::error::{Error, Result};
use crate::queue::Queue;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel identifier, a process-wide namespace shared by all collaborators.
pub type ChannelId = u8;

// =============================================================================
// Channel descriptor
// =============================================================================

/// Static per-message-type configuration, registered once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Channel ID; must not collide across collaborators.
    pub id: ChannelId,
    /// Scheduling priority under the priority queue policy (higher wins).
    pub priority: u8,
    /// Capacity of the per-peer outbound queue, in envelopes.
    pub send_queue_capacity: usize,
    /// Capacity of the channel's inbound queue, in envelopes.
    pub recv_buffer_capacity: usize,
    /// Maximum accepted size of a single inbound message payload.
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: ChannelId, priority: u8) -> Self {
        ChannelDescriptor {
            id,
            priority,
            send_queue_capacity: 64,
            recv_buffer_capacity: 128,
            recv_message_capacity: 1_048_576,
        }
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A routed unit of application payload plus sender/recipient/channel
/// metadata. Immutable once enqueued; ownership moves to the queue on
/// enqueue and to the receiver on dequeue.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Sender, set by the router on inbound envelopes.
    pub from: Option<NodeId>,
    /// Recipient; ignored when `broadcast` is set.
    pub to: Option<NodeId>,
    /// Send to all connected peers, ignoring `to`.
    pub broadcast: bool,
    pub channel_id: ChannelId,
    /// Opaque payload bytes.
    pub message: Bytes,
}

impl Envelope {
    /// An envelope addressed to a single peer.
    pub fn to_peer(to: NodeId, channel_id: ChannelId, message: impl Into<Bytes>) -> Self {
        Envelope {
            from: None,
            to: Some(to),
            broadcast: false,
            channel_id,
            message: message.into(),
        }
    }

    /// An envelope addressed to all connected peers.
    pub fn broadcast(channel_id: ChannelId, message: impl Into<Bytes>) -> Self {
        Envelope {
            from: None,
            to: None,
            broadcast: true,
            channel_id,
            message: message.into(),
        }
    }
}

// =============================================================================
// Peer updates and errors
// =============================================================================

/// Peer state transition visible to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Connected and ready.
    Up,
    /// Disconnected.
    Down,
    /// Observed good behavior; raises the peer's score.
    Good,
    /// Observed bad behavior; lowers the peer's score.
    Bad,
    /// Removed from the peer store.
    Removed,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Up => "up",
            PeerStatus::Down => "down",
            PeerStatus::Good => "good",
            PeerStatus::Bad => "bad",
            PeerStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// An event describing a change in peer state, delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub node_id: NodeId,
    pub status: PeerStatus,
}

impl PeerUpdate {
    pub fn new(node_id: NodeId, status: PeerStatus) -> Self {
        PeerUpdate { node_id, status }
    }
}

/// A report of peer misbehavior, fed back into peer manager scoring via
/// [`Channel::send_error`]. May lead to the peer being disconnected.
#[derive(Debug, Clone)]
pub struct PeerError {
    pub node_id: NodeId,
    pub reason: String,
}

impl PeerError {
    pub fn new(node_id: NodeId, reason: impl Into<String>) -> Self {
        PeerError {
            node_id,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}: {}", self.node_id, self.reason)
    }
}

// =============================================================================
// Channel handle
// =============================================================================

/// A handle to a registered channel: send envelopes to peers, report peer
/// errors, and iterate over inbound envelopes.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    recv_queue: Arc<Queue>,
    out_tx: mpsc::Sender<Envelope>,
    err_tx: mpsc::Sender<PeerError>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        recv_queue: Arc<Queue>,
        out_tx: mpsc::Sender<Envelope>,
        err_tx: mpsc::Sender<PeerError>,
    ) -> Self {
        Channel {
            id,
            recv_queue,
            out_tx,
            err_tx,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Send an envelope on this channel. Returns `Error::Canceled` if `token`
    /// is already canceled or fires before the envelope is enqueued.
    /// Enqueueing is not delivery: envelopes in a torn-down peer queue are
    /// dropped.
    pub async fn send(&self, token: &CancellationToken, mut envelope: Envelope) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }
        envelope.channel_id = self.id;
        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            res = self.out_tx.send(envelope) => res.map_err(|_| Error::QueueClosed),
        }
    }

    /// Report a misbehaving peer, feeding peer manager scoring.
    pub async fn send_error(&self, token: &CancellationToken, error: PeerError) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }
        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            res = self.err_tx.send(error) => res.map_err(|_| Error::QueueClosed),
        }
    }

    /// An iterator over inbound envelopes for this channel. Each call returns
    /// a fresh iterator; iteration is lazy and blocks cooperatively in
    /// [`ChannelIterator::next`].
    pub fn receive(&self) -> ChannelIterator {
        ChannelIterator {
            queue: self.recv_queue.clone(),
            current: None,
        }
    }
}

/// Blocking iterator over a channel's inbound envelopes.
#[derive(Debug)]
pub struct ChannelIterator {
    queue: Arc<Queue>,
    current: Option<Envelope>,
}

impl ChannelIterator {
    /// Advance to the next envelope. Returns `false` immediately if `token`
    /// is already canceled, and unblocks promptly when it fires or the
    /// channel shuts down; the current envelope is cleared in both cases.
    pub async fn next(&mut self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            self.current = None;
            return false;
        }
        tokio::select! {
            _ = token.cancelled() => {
                self.current = None;
                false
            }
            envelope = self.queue.dequeue() => match envelope {
                Some(envelope) => {
                    self.current = Some(envelope);
                    true
                }
                None => {
                    self.current = None;
                    false
                }
            },
        }
    }

    /// The envelope produced by the last successful [`Self::next`] call, or
    /// `None` before the first call and after the iterator ends.
    pub fn envelope(&self) -> Option<&Envelope> {
        self.current.as_ref()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FifoQueue;
    use std::time::Duration;

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes(&[byte; 20]).unwrap()
    }

    fn test_channel(size: usize) -> (Channel, Arc<Queue>, mpsc::Receiver<Envelope>, mpsc::Receiver<PeerError>) {
        let queue = Arc::new(Queue::Fifo(FifoQueue::new(size)));
        let (out_tx, out_rx) = mpsc::channel(size);
        let (err_tx, err_rx) = mpsc::channel(size);
        let channel = Channel::new(0x01, queue.clone(), out_tx, err_tx);
        (channel, queue, out_rx, err_rx)
    }

    #[tokio::test]
    async fn test_send() {
        let (channel, _queue, mut out_rx, _err_rx) = test_channel(1);
        let token = CancellationToken::new();

        channel
            .send(&token, Envelope::to_peer(node_id(1), 0x01, "hello"))
            .await
            .unwrap();

        let env = out_rx.recv().await.unwrap();
        assert_eq!(env.to, Some(node_id(1)));
        assert_eq!(env.message, "hello");
    }

    #[tokio::test]
    async fn test_send_error() {
        let (channel, _queue, _out_rx, mut err_rx) = test_channel(1);
        let token = CancellationToken::new();

        channel
            .send_error(&token, PeerError::new(node_id(1), "bad vote"))
            .await
            .unwrap();

        let err = err_rx.recv().await.unwrap();
        assert_eq!(err.node_id, node_id(1));
        assert_eq!(err.reason, "bad vote");
    }

    #[tokio::test]
    async fn test_send_with_canceled_token() {
        let (channel, _queue, mut out_rx, mut err_rx) = test_channel(64);
        let token = CancellationToken::new();
        token.cancel();

        // Deterministic even with free buffer capacity: an already-canceled
        // token must never enqueue anything.
        for _ in 0..32 {
            let res = channel
                .send(&token, Envelope::to_peer(node_id(1), 0x01, "hello"))
                .await;
            assert!(matches!(res, Err(Error::Canceled)));
            let res = channel
                .send_error(&token, PeerError::new(node_id(1), "bad vote"))
                .await;
            assert!(matches!(res, Err(Error::Canceled)));
        }
        assert!(out_rx.try_recv().is_err());
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receive_with_data() {
        let (channel, queue, _out_rx, _err_rx) = test_channel(1);
        let token = CancellationToken::new();

        queue
            .enqueue(Envelope::to_peer(node_id(2), 0x01, "inbound"))
            .await
            .unwrap();

        let mut iter = channel.receive();
        assert!(iter.next(&token).await);
        assert_eq!(iter.envelope().unwrap().message, "inbound");
        // The envelope stays current until the next call.
        assert_eq!(iter.envelope().unwrap().message, "inbound");
    }

    #[tokio::test]
    async fn test_receive_canceled_token_returns_false() {
        let (channel, _queue, _out_rx, _err_rx) = test_channel(1);
        let token = CancellationToken::new();
        token.cancel();

        let mut iter = channel.receive();
        assert!(!iter.next(&token).await);
        assert!(iter.envelope().is_none());
    }

    #[tokio::test]
    async fn test_receive_unblocks_on_cancel() {
        let (channel, _queue, _out_rx, _err_rx) = test_channel(1);
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut iter = channel.receive();
        let advanced = tokio::time::timeout(Duration::from_millis(100), iter.next(&token))
            .await
            .expect("next did not unblock after cancellation");
        assert!(!advanced);
        assert!(iter.envelope().is_none());
    }

    #[tokio::test]
    async fn test_iterator_clears_after_cancel() {
        let (channel, queue, _out_rx, _err_rx) = test_channel(1);
        let token = CancellationToken::new();

        queue
            .enqueue(Envelope::to_peer(node_id(2), 0x01, "first"))
            .await
            .unwrap();

        let mut iter = channel.receive();
        assert!(iter.next(&token).await);
        assert!(iter.envelope().is_some());

        let canceled = CancellationToken::new();
        canceled.cancel();
        assert!(!iter.next(&canceled).await);
        assert!(iter.envelope().is_none());
    }
}
