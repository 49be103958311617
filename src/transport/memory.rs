//! In-process memory transport
//!
//! Connects transports that share a common [`MemoryNetwork`] broker by node
//! ID, using paired in-memory duplex queues instead of sockets. Used for
//! deterministic simulation and tests.

use crate::address::{Endpoint, NodeId, Protocol};
use crate::channel::ChannelId;
use crate::error::{Error, Result};
use crate::transport::{Connection, NodeInfo, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct MemoryNetworkInner {
    nodes: Mutex<HashMap<NodeId, mpsc::Sender<MemoryConnection>>>,
    buffer_size: usize,
}

/// Shared broker connecting memory transports by node ID. Cheap to clone;
/// all clones share one broker.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<MemoryNetworkInner>,
}

impl MemoryNetwork {
    /// Create a broker whose connections buffer up to `buffer_size` messages
    /// per direction.
    pub fn new(buffer_size: usize) -> Self {
        MemoryNetwork {
            inner: Arc::new(MemoryNetworkInner {
                nodes: Mutex::new(HashMap::new()),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    /// Number of transports currently listening on this network.
    pub fn size(&self) -> usize {
        self.inner.nodes.lock().unwrap().len()
    }

    /// Create a transport for `node_id` attached to this network. The
    /// transport is not listening until [`Transport::listen`] is called.
    pub fn create_transport(&self, node_id: NodeId) -> MemoryTransport {
        let (accept_tx, accept_rx) = mpsc::channel(self.inner.buffer_size);
        MemoryTransport {
            network: self.clone(),
            node_id,
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            listening: Mutex::new(false),
            close: CancellationToken::new(),
        }
    }

    fn register(&self, node_id: NodeId, accept_tx: mpsc::Sender<MemoryConnection>) -> Result<()> {
        let mut nodes = self.inner.nodes.lock().unwrap();
        if nodes.contains_key(&node_id) {
            return Err(Error::AlreadyListening);
        }
        nodes.insert(node_id, accept_tx);
        Ok(())
    }

    fn unregister(&self, node_id: &NodeId) {
        self.inner.nodes.lock().unwrap().remove(node_id);
    }

    fn lookup(&self, node_id: &NodeId) -> Option<mpsc::Sender<MemoryConnection>> {
        self.inner.nodes.lock().unwrap().get(node_id).cloned()
    }
}

/// A transport reachable only through its broker, keyed by node ID. Its
/// endpoints are path-only `memory:` endpoints.
pub struct MemoryTransport {
    network: MemoryNetwork,
    node_id: NodeId,
    accept_tx: mpsc::Sender<MemoryConnection>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MemoryConnection>>,
    listening: Mutex<bool>,
    close: CancellationToken,
}

impl MemoryTransport {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn local_endpoint(&self) -> Endpoint {
        Endpoint::path_only(Protocol::MEMORY, self.node_id.to_string())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn protocol(&self) -> Protocol {
        Protocol::MEMORY
    }

    async fn listen(&self, endpoint: Endpoint) -> Result<()> {
        endpoint.validate()?;
        if endpoint.protocol != Protocol::MEMORY || endpoint.path != self.node_id.as_str() {
            return Err(Error::InvalidEndpoint(format!(
                "cannot listen on {} with memory transport for {}",
                endpoint, self.node_id
            )));
        }
        let mut listening = self.listening.lock().unwrap();
        if *listening {
            return Err(Error::AlreadyListening);
        }
        self.network
            .register(self.node_id.clone(), self.accept_tx.clone())?;
        *listening = true;
        Ok(())
    }

    async fn accept(&self, token: &CancellationToken) -> Result<Box<dyn Connection>> {
        if !*self.listening.lock().unwrap() {
            return Err(Error::NotListening);
        }
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            _ = self.close.cancelled() => Err(Error::TransportClosed),
            conn = accept_rx.recv() => match conn {
                Some(conn) => Ok(Box::new(conn)),
                None => Err(Error::TransportClosed),
            },
        }
    }

    async fn dial(
        &self,
        token: &CancellationToken,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn Connection>> {
        endpoint.validate()?;
        if endpoint.protocol != Protocol::MEMORY {
            return Err(Error::InvalidEndpoint(format!(
                "memory transport cannot dial {}",
                endpoint
            )));
        }
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }
        if self.close.is_cancelled() {
            return Err(Error::TransportClosed);
        }

        let remote_id = NodeId::new(endpoint.path.clone())?;
        let accept_tx = self.network.lookup(&remote_id).ok_or_else(|| {
            Error::InvalidEndpoint(format!("no memory node listening on {}", endpoint))
        })?;

        let (local, remote) =
            MemoryConnection::pair(self.node_id.clone(), remote_id, self.network.inner.buffer_size);

        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            res = accept_tx.send(remote) => match res {
                Ok(()) => Ok(Box::new(local) as Box<dyn Connection>),
                Err(_) => Err(Error::TransportClosed),
            },
        }
    }

    fn endpoint(&self) -> Result<Endpoint> {
        if !*self.listening.lock().unwrap() {
            return Err(Error::NotListening);
        }
        Ok(self.local_endpoint())
    }

    fn close(&self) {
        self.close.cancel();
        self.network.unregister(&self.node_id);
    }
}

/// One half of an in-process connection. The close token is shared between
/// both halves, so closing either side fails subsequent reads and writes on
/// the other.
pub struct MemoryConnection {
    local_id: NodeId,
    remote_id: NodeId,
    msg_tx: mpsc::Sender<(ChannelId, Bytes)>,
    msg_rx: tokio::sync::Mutex<mpsc::Receiver<(ChannelId, Bytes)>>,
    info_tx: mpsc::Sender<NodeInfo>,
    info_rx: tokio::sync::Mutex<mpsc::Receiver<NodeInfo>>,
    close: CancellationToken,
}

impl MemoryConnection {
    fn pair(dialer: NodeId, acceptor: NodeId, buffer_size: usize) -> (Self, Self) {
        let (a_msg_tx, b_msg_rx) = mpsc::channel(buffer_size);
        let (b_msg_tx, a_msg_rx) = mpsc::channel(buffer_size);
        let (a_info_tx, b_info_rx) = mpsc::channel(1);
        let (b_info_tx, a_info_rx) = mpsc::channel(1);
        let close = CancellationToken::new();

        let dialer_half = MemoryConnection {
            local_id: dialer.clone(),
            remote_id: acceptor.clone(),
            msg_tx: a_msg_tx,
            msg_rx: tokio::sync::Mutex::new(a_msg_rx),
            info_tx: a_info_tx,
            info_rx: tokio::sync::Mutex::new(a_info_rx),
            close: close.clone(),
        };
        let acceptor_half = MemoryConnection {
            local_id: acceptor,
            remote_id: dialer,
            msg_tx: b_msg_tx,
            msg_rx: tokio::sync::Mutex::new(b_msg_rx),
            info_tx: b_info_tx,
            info_rx: tokio::sync::Mutex::new(b_info_rx),
            close,
        };
        (dialer_half, acceptor_half)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn handshake(
        &self,
        token: &CancellationToken,
        local_info: NodeInfo,
    ) -> Result<NodeInfo> {
        if self.close.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        self.info_tx
            .send(local_info)
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let mut info_rx = self.info_rx.lock().await;
        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            _ = self.close.cancelled() => Err(Error::ConnectionClosed),
            info = info_rx.recv() => info.ok_or(Error::ConnectionClosed),
        }
    }

    async fn send_message(&self, channel_id: ChannelId, payload: Bytes) -> Result<()> {
        tokio::select! {
            _ = self.close.cancelled() => Err(Error::ConnectionClosed),
            res = self.msg_tx.send((channel_id, payload)) => {
                res.map_err(|_| Error::ConnectionClosed)
            }
        }
    }

    async fn receive_message(&self, token: &CancellationToken) -> Result<(ChannelId, Bytes)> {
        let mut msg_rx = self.msg_rx.lock().await;
        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            _ = self.close.cancelled() => Err(Error::ConnectionClosed),
            msg = msg_rx.recv() => msg.ok_or(Error::ConnectionClosed),
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        Endpoint::path_only(Protocol::MEMORY, self.local_id.to_string())
    }

    fn remote_endpoint(&self) -> Endpoint {
        Endpoint::path_only(Protocol::MEMORY, self.remote_id.to_string())
    }

    async fn close(&self) {
        self.close.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes(&[byte; 20]).unwrap()
    }

    async fn listening_transport(network: &MemoryNetwork, byte: u8) -> MemoryTransport {
        let transport = network.create_transport(node_id(byte));
        let endpoint = Endpoint::path_only(Protocol::MEMORY, node_id(byte).to_string());
        transport.listen(endpoint).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_listen_and_endpoint() {
        let network = MemoryNetwork::new(1);
        let transport = network.create_transport(node_id(1));

        // Not listening yet.
        assert!(transport.endpoint().is_err());
        let token = CancellationToken::new();
        assert!(matches!(
            transport.accept(&token).await,
            Err(Error::NotListening)
        ));

        let endpoint = Endpoint::path_only(Protocol::MEMORY, node_id(1).to_string());
        transport.listen(endpoint.clone()).await.unwrap();
        assert_eq!(transport.endpoint().unwrap(), endpoint);
        assert_eq!(network.size(), 1);

        // Listening twice fails.
        assert!(transport.listen(endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let network = MemoryNetwork::new(1);
        let a = listening_transport(&network, 0x0a).await;
        let b = listening_transport(&network, 0x0b).await;
        let token = CancellationToken::new();

        let dialed = a.dial(&token, &b.endpoint().unwrap()).await.unwrap();
        let accepted = b.accept(&token).await.unwrap();

        assert_eq!(accepted.remote_endpoint(), dialed.local_endpoint());
        assert_eq!(dialed.remote_endpoint(), accepted.local_endpoint());
    }

    #[tokio::test]
    async fn test_handshake_and_messages() {
        let network = MemoryNetwork::new(4);
        let a = listening_transport(&network, 0x0a).await;
        let b = listening_transport(&network, 0x0b).await;
        let token = CancellationToken::new();

        let dialed = a.dial(&token, &b.endpoint().unwrap()).await.unwrap();
        let accepted = b.accept(&token).await.unwrap();

        let t = token.clone();
        let handshake_b = tokio::spawn(async move {
            accepted
                .handshake(&t, NodeInfo::new(node_id(0x0b)))
                .await
                .map(|info| (accepted, info))
        });
        let peer_info = dialed
            .handshake(&token, NodeInfo::new(node_id(0x0a)))
            .await
            .unwrap();
        assert_eq!(peer_info.node_id, node_id(0x0b));
        let (accepted, peer_info) = handshake_b.await.unwrap().unwrap();
        assert_eq!(peer_info.node_id, node_id(0x0a));

        dialed
            .send_message(0x01, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let (channel_id, payload) = accepted.receive_message(&token).await.unwrap();
        assert_eq!(channel_id, 0x01);
        assert_eq!(payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_close_fails_other_side() {
        let network = MemoryNetwork::new(1);
        let a = listening_transport(&network, 0x0a).await;
        let b = listening_transport(&network, 0x0b).await;
        let token = CancellationToken::new();

        let dialed = a.dial(&token, &b.endpoint().unwrap()).await.unwrap();
        let accepted = b.accept(&token).await.unwrap();

        dialed.close().await;
        assert!(matches!(
            accepted.receive_message(&token).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(dialed
            .send_message(0x01, Bytes::from_static(b"late"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_accept_cancellation_and_close() {
        let network = MemoryNetwork::new(1);
        let transport = Arc::new(listening_transport(&network, 0x0a).await);

        // Cancellation is distinguishable from transport close.
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            transport.accept(&token).await,
            Err(Error::Canceled)
        ));

        let t = transport.clone();
        let pending = tokio::spawn(async move {
            let token = CancellationToken::new();
            t.accept(&token).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.close();

        let res = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept did not unblock on close")
            .unwrap();
        assert!(matches!(res, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_dial_with_canceled_token() {
        let network = MemoryNetwork::new(1);
        let a = listening_transport(&network, 0x0a).await;
        let b = listening_transport(&network, 0x0b).await;

        let token = CancellationToken::new();
        token.cancel();
        // Deterministic even with acceptor capacity free: an already-canceled
        // token must never hand a connection to the remote side.
        for _ in 0..32 {
            assert!(matches!(
                a.dial(&token, &b.endpoint().unwrap()).await,
                Err(Error::Canceled)
            ));
        }
        let fresh = CancellationToken::new();
        let pending = tokio::time::timeout(Duration::from_millis(50), b.accept(&fresh)).await;
        assert!(pending.is_err(), "canceled dials must not reach the acceptor");
    }

    #[tokio::test]
    async fn test_dial_unknown_peer() {
        let network = MemoryNetwork::new(1);
        let a = listening_transport(&network, 0x0a).await;
        let token = CancellationToken::new();

        let endpoint = Endpoint::path_only(Protocol::MEMORY, node_id(0x0c).to_string());
        assert!(a.dial(&token, &endpoint).await.is_err());
    }
}
