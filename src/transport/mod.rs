//! Pluggable transports
//!
//! A transport binds to an endpoint and produces bidirectional,
//! message-framed [`Connection`]s on dial and accept. Two implementations
//! exist: an in-process memory transport for deterministic tests and
//! simulation, and a framed TCP transport multiplexing logical channels over
//! one stream.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::address::{Endpoint, NodeId, Protocol};
use crate::channel::ChannelId;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Node metadata exchanged during the connection handshake. Cryptographic
/// authentication of the handshake is the transport's concern and not
/// re-specified here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    /// Channels the node serves; the router drops traffic for the rest.
    pub channels: Vec<ChannelId>,
    /// Human-readable node name for logs.
    pub moniker: String,
}

impl NodeInfo {
    pub fn new(node_id: NodeId) -> Self {
        NodeInfo {
            node_id,
            channels: Vec::new(),
            moniker: String::new(),
        }
    }

    pub fn with_channels(mut self, channels: Vec<ChannelId>) -> Self {
        self.channels = channels;
        self
    }
}

/// A transport: listen on an endpoint, accept inbound connections, dial
/// outbound ones.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The protocol this transport speaks, used to match dial endpoints.
    fn protocol(&self) -> Protocol;

    /// Bind to the given endpoint. Fails if already listening or if the
    /// endpoint is invalid for this transport.
    async fn listen(&self, endpoint: Endpoint) -> Result<()>;

    /// Wait for an inbound connection. Returns `Error::Canceled` when the
    /// token fires and `Error::TransportClosed` once the transport is closed;
    /// never hangs silently.
    async fn accept(&self, token: &CancellationToken) -> Result<Box<dyn Connection>>;

    /// Dial an outbound connection, blocking until established, canceled, or
    /// failed.
    async fn dial(&self, token: &CancellationToken, endpoint: &Endpoint)
        -> Result<Box<dyn Connection>>;

    /// The endpoint the transport is listening on. Fails if not listening.
    fn endpoint(&self) -> Result<Endpoint>;

    /// Close the transport, unblocking pending accepts.
    fn close(&self);
}

/// An open, bidirectional, channel-multiplexed stream to one remote node.
/// Owned by exactly one transport; destroyed on close, after which all reads
/// and writes fail.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Exchange node info with the remote peer. Must be called exactly once,
    /// before any messages.
    async fn handshake(&self, token: &CancellationToken, local_info: NodeInfo)
        -> Result<NodeInfo>;

    /// Send a framed message on the given logical channel.
    async fn send_message(&self, channel_id: ChannelId, payload: Bytes) -> Result<()>;

    /// Receive the next framed message from any channel.
    async fn receive_message(&self, token: &CancellationToken) -> Result<(ChannelId, Bytes)>;

    fn local_endpoint(&self) -> Endpoint;

    fn remote_endpoint(&self) -> Endpoint;

    /// Close the connection; pending and future operations on either side
    /// fail.
    async fn close(&self);
}
