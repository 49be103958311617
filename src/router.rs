//! Message router
//!
//! The router wires everything together: it accepts and dials connections
//! through the transports, runs the handshake, and pumps envelopes between
//! per-channel queues and per-peer queues. Reactors only ever see a
//! [`Channel`]; peers only ever see a transport connection.
//!
//! Topology of one running router:
//!
//! - One outbound routing task per open channel, fanning envelopes out to the
//!   per-peer send queues.
//! - One accept loop per listening transport, plus one task per inbound
//!   connection carrying admission checks, handshake, and the pumps.
//! - One dial loop feeding off [`PeerManager::dial_next`], plus one task per
//!   outbound connection attempt.
//! - One send pump and one receive pump per connected peer.

use crate::address::{NodeAddress, NodeId};
use crate::channel::{Channel, ChannelDescriptor, ChannelId, Envelope, PeerError};
use crate::conn_tracker::ConnTracker;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::peer::PeerManager;
use crate::queue::{
    FifoQueue, PriorityQueue, Queue, QueueType, DEFAULT_PRIORITY_QUEUE_CAPACITY,
};
use crate::transport::{Connection, NodeInfo, Transport};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Admission predicate for inbound connections; returning `false` rejects
/// the connection before the handshake.
pub type IpFilter = Arc<dyn Fn(IpAddr, u16) -> bool + Send + Sync>;

// =============================================================================
// Options
// =============================================================================

#[derive(Clone)]
pub struct RouterOptions {
    /// Queue policy name, `"fifo"` or `"priority"`. Empty selects the
    /// default policy.
    pub queue_type: String,
    /// Inbound connection filter, applied before the handshake.
    pub filter_peer_by_ip: Option<IpFilter>,
    /// Deadline for the node info exchange on new connections.
    pub handshake_timeout: Duration,
    /// Cap on concurrent inbound connections per IP.
    pub max_connections_per_ip: u32,
    /// How long an IP that dropped to zero connections still counts against
    /// immediate re-admission.
    pub reconnect_window: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        RouterOptions {
            queue_type: String::new(),
            filter_peer_by_ip: None,
            handshake_timeout: Duration::from_secs(5),
            max_connections_per_ip: 100,
            reconnect_window: Duration::from_secs(10),
        }
    }
}

impl RouterOptions {
    /// Validates the options, populating the default queue type in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.queue_type.is_empty() {
            self.queue_type = QueueType::default().to_string();
        }
        self.queue_type.parse::<QueueType>()?;
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake timeout cannot be zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Router
// =============================================================================

struct ChannelReg {
    descriptor: ChannelDescriptor,
    recv_queue: Arc<Queue>,
}

struct PeerHandle {
    queue: Arc<Queue>,
    token: CancellationToken,
}

struct RouterInner {
    node_info: NodeInfo,
    channel_ids: Mutex<Vec<ChannelId>>,
    peer_manager: Arc<PeerManager>,
    transports: Vec<Arc<dyn Transport>>,
    metrics: Arc<Metrics>,
    conn_tracker: ConnTracker,
    options: RouterOptions,
    queue_type: QueueType,
    channels: Mutex<HashMap<ChannelId, ChannelReg>>,
    peer_queues: Mutex<HashMap<NodeId, PeerHandle>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Per-connection tasks, joined in `wait` so shutdown observes full
    /// peer teardown.
    conn_tasks: TaskTracker,
    started: Mutex<bool>,
}

/// Routes envelopes between local channels and remote peers. Cheap to clone;
/// all clones share one router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Creates a router over the given transports. Transports that should
    /// accept inbound connections must already be listening when
    /// [`Router::start`] is called. Configuration errors surface here.
    pub fn new(
        node_info: NodeInfo,
        peer_manager: Arc<PeerManager>,
        transports: Vec<Arc<dyn Transport>>,
        metrics: Arc<Metrics>,
        mut options: RouterOptions,
    ) -> Result<Self> {
        options.validate()?;
        let queue_type = options.queue_type.parse()?;
        Ok(Router {
            inner: Arc::new(RouterInner {
                node_info,
                channel_ids: Mutex::new(Vec::new()),
                peer_manager,
                transports,
                metrics,
                conn_tracker: ConnTracker::new(
                    options.max_connections_per_ip,
                    options.reconnect_window,
                ),
                options,
                queue_type,
                channels: Mutex::new(HashMap::new()),
                peer_queues: Mutex::new(HashMap::new()),
                token: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                conn_tasks: TaskTracker::new(),
                started: Mutex::new(false),
            }),
        })
    }

    /// Opens a channel for a reactor. The ID must be unique across the node.
    pub fn open_channel(&self, descriptor: ChannelDescriptor) -> Result<Channel> {
        let inner = &self.inner;
        let mut channels = inner.channels.lock().unwrap();
        if channels.contains_key(&descriptor.id) {
            return Err(Error::DuplicateChannel(descriptor.id));
        }

        let recv_queue = self.make_recv_queue(&descriptor);
        let buffer = descriptor.send_queue_capacity.max(1);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (err_tx, err_rx) = mpsc::channel(buffer);
        let id = descriptor.id;
        channels.insert(
            id,
            ChannelReg {
                descriptor,
                recv_queue: recv_queue.clone(),
            },
        );
        drop(channels);
        inner.channel_ids.lock().unwrap().push(id);

        let router = self.clone();
        let task = tokio::spawn(async move { router.route_channel(out_rx, err_rx).await });
        inner.tasks.lock().unwrap().push(task);

        Ok(Channel::new(id, recv_queue, out_tx, err_tx))
    }

    /// Spawns the dial and accept loops. May only be called once.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut started = inner.started.lock().unwrap();
        if *started {
            return Err(Error::Config("router already started".into()));
        }
        *started = true;

        let mut tasks = inner.tasks.lock().unwrap();
        tasks.push(tokio::spawn({
            let router = self.clone();
            async move {
                let token = router.inner.token.clone();
                router.inner.peer_manager.run(&token).await;
            }
        }));
        tasks.push(tokio::spawn({
            let router = self.clone();
            async move { router.dial_peers().await }
        }));
        for transport in &inner.transports {
            if transport.endpoint().is_ok() {
                tasks.push(tokio::spawn({
                    let router = self.clone();
                    let transport = transport.clone();
                    async move { router.accept_peers(transport).await }
                }));
            }
        }
        Ok(())
    }

    /// Signals shutdown: cancels all loops, closes the transports, and shuts
    /// every queue so channel iterators terminate.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.token.cancel();
        for transport in &inner.transports {
            transport.close();
        }
        for handle in inner.peer_queues.lock().unwrap().values() {
            handle.token.cancel();
            handle.queue.close();
        }
        for reg in inner.channels.lock().unwrap().values() {
            reg.recv_queue.close();
        }
    }

    /// Waits for the router's long-lived tasks and every in-flight
    /// connection task to finish; peers are fully torn down on return.
    pub async fn wait(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.inner.conn_tasks.close();
        self.inner.conn_tasks.wait().await;
    }

    fn local_node_info(&self) -> NodeInfo {
        self.inner
            .node_info
            .clone()
            .with_channels(self.inner.channel_ids.lock().unwrap().clone())
    }

    fn make_recv_queue(&self, descriptor: &ChannelDescriptor) -> Arc<Queue> {
        match self.inner.queue_type {
            QueueType::Fifo => Arc::new(Queue::Fifo(FifoQueue::new(
                descriptor.recv_buffer_capacity,
            ))),
            QueueType::Priority => Arc::new(Queue::Priority(PriorityQueue::new(
                std::slice::from_ref(descriptor),
                DEFAULT_PRIORITY_QUEUE_CAPACITY,
                self.inner.metrics.clone(),
            ))),
        }
    }

    fn make_peer_queue(&self) -> Arc<Queue> {
        let channels = self.inner.channels.lock().unwrap();
        match self.inner.queue_type {
            QueueType::Fifo => {
                let size: usize = channels
                    .values()
                    .map(|reg| reg.descriptor.send_queue_capacity)
                    .sum();
                Arc::new(Queue::Fifo(FifoQueue::new(size.max(1))))
            }
            QueueType::Priority => {
                let descriptors: Vec<ChannelDescriptor> = channels
                    .values()
                    .map(|reg| reg.descriptor.clone())
                    .collect();
                Arc::new(Queue::Priority(PriorityQueue::new(
                    &descriptors,
                    DEFAULT_PRIORITY_QUEUE_CAPACITY,
                    self.inner.metrics.clone(),
                )))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outbound routing
    // -------------------------------------------------------------------------

    /// Consumes one channel's outbound envelopes and peer error reports.
    async fn route_channel(
        self,
        mut out_rx: mpsc::Receiver<Envelope>,
        mut err_rx: mpsc::Receiver<PeerError>,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                envelope = out_rx.recv() => match envelope {
                    Some(envelope) => self.route_envelope(envelope).await,
                    None => break,
                },
                error = err_rx.recv() => match error {
                    Some(error) => {
                        self.inner.peer_manager.errored(&error.node_id, &error.reason);
                        self.disconnect_peer(&error.node_id);
                    }
                    None => break,
                },
            }
        }
    }

    /// Delivers one envelope to its recipient queue, or to every peer queue
    /// for broadcasts. Envelopes for unconnected peers are dropped.
    async fn route_envelope(&self, envelope: Envelope) {
        let targets: Vec<(NodeId, Arc<Queue>)> = {
            let queues = self.inner.peer_queues.lock().unwrap();
            if envelope.broadcast {
                queues
                    .iter()
                    .map(|(id, handle)| (id.clone(), handle.queue.clone()))
                    .collect()
            } else {
                let Some(to) = &envelope.to else {
                    log::debug!(
                        "dropping envelope on channel {} with no recipient",
                        envelope.channel_id
                    );
                    return;
                };
                match queues.get(to) {
                    Some(handle) => vec![(to.clone(), handle.queue.clone())],
                    None => {
                        log::debug!("dropping envelope for disconnected peer {}", to);
                        return;
                    }
                }
            }
        };

        for (node_id, queue) in targets {
            let mut envelope = envelope.clone();
            envelope.to = Some(node_id);
            // A closed queue means the peer went down mid-send; drop.
            let _ = queue.enqueue(envelope).await;
        }
    }

    /// Forces teardown of one peer's connection.
    fn disconnect_peer(&self, node_id: &NodeId) {
        if let Some(handle) = self.inner.peer_queues.lock().unwrap().get(node_id) {
            handle.token.cancel();
            handle.queue.close();
        }
    }

    // -------------------------------------------------------------------------
    // Inbound connections
    // -------------------------------------------------------------------------

    async fn accept_peers(self, transport: Arc<dyn Transport>) {
        loop {
            let conn = match transport.accept(&self.inner.token).await {
                Ok(conn) => conn,
                Err(Error::Canceled) | Err(Error::TransportClosed) => break,
                Err(e) => {
                    log::error!("failed to accept connection: {}", e);
                    break;
                }
            };
            let router = self.clone();
            self.inner
                .conn_tasks
                .spawn(async move { router.open_connection(conn).await });
        }
    }

    async fn open_connection(self, conn: Box<dyn Connection>) {
        let inner = &self.inner;
        let remote = conn.remote_endpoint();

        // Admission checks only apply to IP-bearing transports.
        let tracked_ip = match remote.ip {
            Some(ip) => {
                if let Err(e) = inner.conn_tracker.add_conn(ip) {
                    log::debug!("rejecting connection from {}: {}", ip, e);
                    inner.metrics.rejected_connection();
                    conn.close().await;
                    return;
                }
                if let Some(filter) = &inner.options.filter_peer_by_ip {
                    if !filter(ip, remote.port) {
                        log::debug!("filtered connection from {}", ip);
                        inner.metrics.filtered_connection();
                        inner.conn_tracker.remove_conn(ip);
                        conn.close().await;
                        return;
                    }
                }
                Some(ip)
            }
            None => None,
        };

        match self.handshake_peer(conn.as_ref(), None).await {
            Ok(peer_info) => match inner.peer_manager.accepted(&peer_info.node_id) {
                Ok(()) => self.route_peer(peer_info.node_id, conn.as_ref()).await,
                Err(e) => log::debug!("rejecting peer {}: {}", peer_info.node_id, e),
            },
            Err(e) => {
                if !e.is_canceled() {
                    log::debug!("handshake with {} failed: {}", remote, e);
                }
            }
        }

        conn.close().await;
        if let Some(ip) = tracked_ip {
            inner.conn_tracker.remove_conn(ip);
        }
    }

    /// Exchanges node info within the handshake deadline and validates the
    /// result. Connecting to ourselves or to an unexpected node ID fails.
    async fn handshake_peer(
        &self,
        conn: &dyn Connection,
        expect: Option<&NodeId>,
    ) -> Result<NodeInfo> {
        let info = tokio::time::timeout(
            self.inner.options.handshake_timeout,
            conn.handshake(&self.inner.token, self.local_node_info()),
        )
        .await
        .map_err(|_| Error::Handshake("handshake timed out".into()))??;

        info.node_id.validate()?;
        if info.node_id == self.inner.node_info.node_id {
            return Err(Error::Handshake("connected to self".into()));
        }
        if let Some(expected) = expect {
            if &info.node_id != expected {
                return Err(Error::Handshake(format!(
                    "dialed {} but connected to {}",
                    expected, info.node_id
                )));
            }
        }
        Ok(info)
    }

    // -------------------------------------------------------------------------
    // Outbound connections
    // -------------------------------------------------------------------------

    async fn dial_peers(self) {
        loop {
            let address = match self.inner.peer_manager.dial_next(&self.inner.token).await {
                Ok(address) => address,
                Err(_) => break,
            };
            let router = self.clone();
            self.inner
                .conn_tasks
                .spawn(async move { router.connect_peer(address).await });
        }
    }

    async fn connect_peer(self, address: NodeAddress) {
        let inner = &self.inner;
        let conn = match self.dial_peer(&address).await {
            Ok(conn) => conn,
            Err(e) => {
                if e.is_canceled() {
                    return;
                }
                log::debug!("failed to dial {}: {}", address, e);
                if let Err(e) = inner.peer_manager.dial_failed(&address) {
                    log::warn!("failed to record dial failure for {}: {}", address, e);
                }
                return;
            }
        };

        match self.handshake_peer(conn.as_ref(), Some(&address.node_id)).await {
            Ok(_) => match inner.peer_manager.dialed(&address) {
                Ok(()) => {
                    self.route_peer(address.node_id.clone(), conn.as_ref())
                        .await
                }
                Err(e) => log::debug!("rejecting dialed peer {}: {}", address, e),
            },
            Err(e) => {
                if !e.is_canceled() {
                    log::debug!("handshake with {} failed: {}", address, e);
                    if let Err(e) = inner.peer_manager.dial_failed(&address) {
                        log::warn!("failed to record dial failure for {}: {}", address, e);
                    }
                }
            }
        }
        conn.close().await;
    }

    /// Resolves the address and dials its endpoints in order, using the first
    /// transport whose protocol matches, until one connects.
    async fn dial_peer(&self, address: &NodeAddress) -> Result<Box<dyn Connection>> {
        let endpoints = address.resolve().await?;
        if endpoints.is_empty() {
            return Err(Error::InvalidEndpoint(format!(
                "address {} resolved to no endpoints",
                address
            )));
        }

        let mut last_err = None;
        for endpoint in endpoints {
            let transport = self
                .inner
                .transports
                .iter()
                .find(|t| t.protocol() == endpoint.protocol);
            let Some(transport) = transport else {
                continue;
            };
            match transport.dial(&self.inner.token, &endpoint).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    log::debug!("failed to dial {}: {}", endpoint, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::InvalidEndpoint(format!("no transport for address {}", address))
        }))
    }

    // -------------------------------------------------------------------------
    // Peer pumps
    // -------------------------------------------------------------------------

    /// Runs a connected peer until either pump exits, then tears it down:
    /// pumps stop, the peer queue closes, the connection closes, and the peer
    /// manager broadcasts `Down`.
    async fn route_peer(&self, peer_id: NodeId, conn: &dyn Connection) {
        let inner = &self.inner;
        let queue = self.make_peer_queue();
        let peer_token = inner.token.child_token();
        inner.peer_queues.lock().unwrap().insert(
            peer_id.clone(),
            PeerHandle {
                queue: queue.clone(),
                token: peer_token.clone(),
            },
        );
        inner.peer_manager.ready(&peer_id);
        inner.metrics.peers_up();
        log::info!("peer {} is up", peer_id);

        tokio::select! {
            _ = self.send_pump(conn, &queue, &peer_token) => {}
            _ = self.recv_pump(&peer_id, conn, &peer_token) => {}
        }

        peer_token.cancel();
        queue.close();
        inner.peer_queues.lock().unwrap().remove(&peer_id);
        conn.close().await;
        inner.peer_manager.disconnected(&peer_id);
        inner.metrics.peers_down();
        log::info!("peer {} is down", peer_id);
    }

    /// Drains the peer's send queue into the connection. A write failure
    /// exits the pump, which tears the whole peer down.
    async fn send_pump(
        &self,
        conn: &dyn Connection,
        queue: &Arc<Queue>,
        token: &CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = token.cancelled() => break,
                envelope = queue.dequeue() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let size = envelope.message.len();
            if let Err(e) = conn.send_message(envelope.channel_id, envelope.message).await {
                if !e.is_canceled() {
                    log::debug!("failed to send to peer: {}", e);
                }
                break;
            }
            self.inner.metrics.add_sent_bytes(size);
        }
    }

    /// Feeds inbound messages into their channel's receive queue. Messages
    /// for unregistered channels are dropped and counted, not fatal.
    async fn recv_pump(
        &self,
        peer_id: &NodeId,
        conn: &dyn Connection,
        token: &CancellationToken,
    ) {
        let inner = &self.inner;
        loop {
            let (channel_id, payload) = match conn.receive_message(token).await {
                Ok(message) => message,
                Err(e) => {
                    if !e.is_canceled() && !matches!(e, Error::ConnectionClosed) {
                        log::debug!("failed to receive from {}: {}", peer_id, e);
                    }
                    break;
                }
            };

            let registered = {
                let channels = inner.channels.lock().unwrap();
                channels.get(&channel_id).map(|reg| {
                    (reg.recv_queue.clone(), reg.descriptor.recv_message_capacity)
                })
            };
            let Some((recv_queue, max_size)) = registered else {
                log::debug!(
                    "dropping message from {} for unknown channel {}",
                    peer_id,
                    channel_id
                );
                inner.metrics.unknown_channel_msg();
                continue;
            };

            if payload.len() > max_size {
                inner.peer_manager.errored(
                    peer_id,
                    &format!("message of {} bytes exceeds channel limit", payload.len()),
                );
                break;
            }

            inner.metrics.add_received_bytes(payload.len());
            let envelope = Envelope {
                from: Some(peer_id.clone()),
                to: None,
                broadcast: false,
                channel_id,
                message: payload,
            };
            if recv_queue.enqueue(envelope).await.is_err() {
                break;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
