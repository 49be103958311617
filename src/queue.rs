//! Envelope queues
//!
//! Queues do QoS scheduling for envelopes at contention points:
//!
//! - Receiving inbound messages to a single channel from all peers.
//! - Sending outbound messages to a single peer from all channels.
//!
//! Two policies exist: a lossless FIFO that blocks the producer when full,
//! and a priority scheduler with a total byte capacity that sheds the oldest
//! lowest-priority traffic under pressure instead of blocking.

use crate::channel::{ChannelDescriptor, ChannelId, Envelope};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Default byte capacity for a priority queue (~16MB).
pub const DEFAULT_PRIORITY_QUEUE_CAPACITY: u64 = 16 * 1024 * 1024;

// =============================================================================
// Queue type selection
// =============================================================================

/// Queue scheduling policy, validated once at router construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueType {
    #[default]
    Fifo,
    Priority,
}

impl FromStr for QueueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(QueueType::Fifo),
            "priority" => Ok(QueueType::Priority),
            other => Err(Error::Config(format!("unknown queue type {:?}", other))),
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueType::Fifo => f.write_str("fifo"),
            QueueType::Priority => f.write_str("priority"),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// A queue under one of the two scheduling policies. The policy set is closed
/// at compile time, so dispatch is a plain enum rather than a trait object.
#[derive(Debug)]
pub(crate) enum Queue {
    Fifo(FifoQueue),
    Priority(PriorityQueue),
}

impl Queue {
    pub(crate) async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        match self {
            Queue::Fifo(q) => q.enqueue(envelope).await,
            Queue::Priority(q) => q.enqueue(envelope),
        }
    }

    /// Dequeue the next envelope according to the policy. Returns `None` once
    /// the queue is closed and drained. Cancel-safe: dropping the future
    /// never loses an envelope.
    pub(crate) async fn dequeue(&self) -> Option<Envelope> {
        match self {
            Queue::Fifo(q) => q.dequeue().await,
            Queue::Priority(q) => q.dequeue().await,
        }
    }

    /// Close the queue. Safe to call concurrently with producers and
    /// consumers, and completes even if nobody is draining the queue.
    pub(crate) fn close(&self) {
        match self {
            Queue::Fifo(q) => q.close(),
            Queue::Priority(q) => q.close(),
        }
    }
}

// =============================================================================
// FIFO queue
// =============================================================================

/// Lossless bounded pass-through queue: dequeue order equals enqueue order,
/// and a full buffer blocks the producer until there is room or the queue is
/// closed.
#[derive(Debug)]
pub(crate) struct FifoQueue {
    tx: mpsc::Sender<Envelope>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    close: CancellationToken,
}

impl FifoQueue {
    pub(crate) fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size.max(1));
        FifoQueue {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            close: CancellationToken::new(),
        }
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        tokio::select! {
            _ = self.close.cancelled() => Err(Error::QueueClosed),
            res = self.tx.send(envelope) => res.map_err(|_| Error::QueueClosed),
        }
    }

    async fn dequeue(&self) -> Option<Envelope> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            // Bias towards draining buffered envelopes over observing close.
            biased;
            envelope = rx.recv() => envelope,
            _ = self.close.cancelled() => None,
        }
    }

    fn close(&self) {
        self.close.cancel();
    }
}

// =============================================================================
// Priority queue
// =============================================================================

/// Sort key for buffered envelopes: highest channel priority first, then
/// arrival order within the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PqKey {
    priority: Reverse<u8>,
    seq: u64,
}

#[derive(Debug, Default)]
struct PqInner {
    buf: BTreeMap<PqKey, Envelope>,
    /// Buffered payload bytes.
    size: u64,
    /// Arrival counter; also the tie-break within a priority bucket.
    seq: u64,
}

/// Priority scheduler with a total byte capacity. Dequeue always prefers the
/// highest non-empty priority bucket; when an enqueue would exceed capacity,
/// the oldest buffered envelope of the lowest priority is dropped until the
/// new one fits. Producers are never blocked for priority reasons.
#[derive(Debug)]
pub(crate) struct PriorityQueue {
    inner: Mutex<PqInner>,
    /// Per-channel priority, fixed at registration.
    priorities: HashMap<ChannelId, u8>,
    capacity: u64,
    notify: Notify,
    close: CancellationToken,
    metrics: Arc<Metrics>,
}

impl PriorityQueue {
    pub(crate) fn new(
        descriptors: &[ChannelDescriptor],
        capacity: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let priorities = descriptors.iter().map(|d| (d.id, d.priority)).collect();
        PriorityQueue {
            inner: Mutex::new(PqInner::default()),
            priorities,
            capacity,
            notify: Notify::new(),
            close: CancellationToken::new(),
            metrics,
        }
    }

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        let priority = self
            .priorities
            .get(&envelope.channel_id)
            .copied()
            .unwrap_or(0);
        let incoming_size = envelope.message.len() as u64;

        {
            let mut inner = self.inner.lock().unwrap();
            if self.close.is_cancelled() {
                return Err(Error::QueueClosed);
            }

            inner.seq += 1;
            let key = PqKey {
                priority: Reverse(priority),
                seq: inner.seq,
            };
            inner.buf.insert(key, envelope);
            inner.size += incoming_size;

            // Shed the oldest envelope of the lowest buffered priority until
            // we fit. The incoming envelope only sheds itself when everything
            // else buffered outranks it.
            while inner.size > self.capacity {
                let lowest = match inner.buf.keys().next_back() {
                    Some(key) => key.priority,
                    None => break,
                };
                let victim_key = *inner
                    .buf
                    .range(PqKey { priority: lowest, seq: 0 }..)
                    .next()
                    .map(|(k, _)| k)
                    .unwrap_or(&key);
                if let Some(victim) = inner.buf.remove(&victim_key) {
                    inner.size -= victim.message.len() as u64;
                    self.metrics.add_dropped_msgs(1);
                    log::debug!(
                        "dropped envelope for channel {} (priority {}) under queue pressure",
                        victim.channel_id,
                        victim_key.priority.0
                    );
                }
                if victim_key == key {
                    // The incoming envelope was the victim; nothing lower
                    // priority remains to shed.
                    break;
                }
            }
        }

        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<Envelope> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the buffer so that a
            // concurrent enqueue cannot slip between check and await.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some((_, envelope)) = inner.buf.pop_first() {
                    inner.size -= envelope.message.len() as u64;
                    return Some(envelope);
                }
                if self.close.is_cancelled() {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.close.cancelled() => {}
            }
        }
    }

    fn close(&self) {
        self.close.cancel();
        self.notify.notify_one();
    }
}

// =============================================================================
// Tests
// =============================================================================
