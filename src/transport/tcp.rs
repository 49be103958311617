//! Framed TCP transport
//!
//! Multiplexes logical channels over one TCP stream using length-prefixed
//! framing. A frame is either the handshake (node info, JSON body) or a data
//! frame carrying a channel ID and an opaque payload.
//!
//! The listener honors a cap on simultaneously accepted, not-yet-closed
//! inbound connections: attempts beyond the cap are accepted at the socket
//! level but not surfaced via `accept` until an existing connection closes
//! (bounded backlog, not rejection).

use crate::address::{Endpoint, Protocol};
use crate::channel::ChannelId;
use crate::error::{Error, Result};
use crate::transport::{Connection, NodeInfo, Transport};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

/// Magic bytes prefixing every frame.
pub const MAGIC: [u8; 4] = [0x70, 0x6e, 0x65, 0x74]; // "pnet"

/// Default maximum frame body size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

const FRAME_HANDSHAKE: u8 = 0x00;
const FRAME_MESSAGE: u8 = 0x01;

// =============================================================================
// Frame codec
// =============================================================================

/// A single wire frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    /// Node info exchange, sent once per side before any messages.
    Handshake(NodeInfo),
    /// Application payload on a logical channel.
    Message { channel_id: ChannelId, payload: Bytes },
}

/// Length-prefixed frame codec: magic (4) + length (4) + kind (1) + body.
pub(crate) struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub(crate) fn new(max_frame_size: usize) -> Self {
        FrameCodec { max_frame_size }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> std::io::Result<()> {
        let body = match &item {
            Frame::Handshake(info) => serde_json::to_vec(info)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            Frame::Message { channel_id, payload } => {
                let mut body = Vec::with_capacity(1 + payload.len());
                body.push(*channel_id);
                body.extend_from_slice(payload);
                body
            }
        };
        let kind = match item {
            Frame::Handshake(_) => FRAME_HANDSHAKE,
            Frame::Message { .. } => FRAME_MESSAGE,
        };

        // Magic (4) + Length (4) + Kind (1) + Body
        dst.reserve(9 + body.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(1 + body.len() as u32);
        dst.put_u8(kind);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len == 0 || len > self.max_frame_size + 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        if src.len() < 8 + len {
            return Ok(None);
        }

        src.advance(8);
        let kind = src[0];
        let mut body = src.split_to(len);
        body.advance(1);

        match kind {
            FRAME_HANDSHAKE => {
                let info: NodeInfo = serde_json::from_slice(&body)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                Ok(Some(Frame::Handshake(info)))
            }
            FRAME_MESSAGE => {
                if body.is_empty() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "empty message frame",
                    ));
                }
                let channel_id = body[0];
                body.advance(1);
                Ok(Some(Frame::Message {
                    channel_id,
                    payload: body.freeze(),
                }))
            }
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown frame kind {:#04x}", other),
            )),
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// TCP transport options.
#[derive(Debug, Clone)]
pub struct TcpTransportOptions {
    /// Cap on simultaneously accepted inbound connections; `None` means
    /// unlimited.
    pub max_accepted_connections: Option<usize>,
    /// Maximum frame body size accepted from the wire.
    pub max_frame_size: usize,
}

impl Default for TcpTransportOptions {
    fn default() -> Self {
        TcpTransportOptions {
            max_accepted_connections: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// A [`Transport`] over framed TCP streams.
pub struct TcpTransport {
    options: TcpTransportOptions,
    listen_endpoint: Mutex<Option<Endpoint>>,
    accept_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TcpConnection>>>,
    close: CancellationToken,
}

impl TcpTransport {
    pub fn new(options: TcpTransportOptions) -> Self {
        TcpTransport {
            options,
            listen_endpoint: Mutex::new(None),
            accept_rx: tokio::sync::Mutex::new(None),
            close: CancellationToken::new(),
        }
    }

    fn validate_endpoint(endpoint: &Endpoint) -> Result<()> {
        endpoint.validate()?;
        if endpoint.protocol != Protocol::TCP {
            return Err(Error::InvalidEndpoint(format!(
                "tcp transport does not support protocol {:?}",
                endpoint.protocol.as_str()
            )));
        }
        if endpoint.ip.is_none() {
            return Err(Error::InvalidEndpoint("endpoint has no IP".into()));
        }
        if !endpoint.path.is_empty() {
            return Err(Error::InvalidEndpoint(format!(
                "tcp endpoint cannot have a path {:?}",
                endpoint.path
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::TCP
    }

    async fn listen(&self, endpoint: Endpoint) -> Result<()> {
        Self::validate_endpoint(&endpoint)?;
        if self.listen_endpoint.lock().unwrap().is_some() {
            return Err(Error::AlreadyListening);
        }
        if self.close.is_cancelled() {
            return Err(Error::TransportClosed);
        }

        let bind_addr = endpoint
            .socket_addr()
            .ok_or_else(|| Error::InvalidEndpoint("endpoint has no IP".into()))?;
        // Port 0 binds an ephemeral port; report the real one.
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let bound = Endpoint::new(Protocol::TCP, local_addr.ip(), local_addr.port());
        *self.listen_endpoint.lock().unwrap() = Some(bound.clone());
        log::info!("listening on {}", bound);

        let (accept_tx, accept_rx) = mpsc::channel(1);
        *self.accept_rx.lock().await = Some(accept_rx);

        let close = self.close.clone();
        let max_frame_size = self.options.max_frame_size;
        let permits = self
            .options
            .max_accepted_connections
            .unwrap_or(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));

        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = tokio::select! {
                    _ = close.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            continue;
                        }
                    },
                };

                // The socket is accepted; hold it back until a slot frees up.
                let permit = tokio::select! {
                    _ = close.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let conn = match TcpConnection::new(stream, max_frame_size, Some(permit)) {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("failed to set up connection from {}: {}", peer_addr, e);
                        continue;
                    }
                };
                if accept_tx.send(conn).await.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    async fn accept(&self, token: &CancellationToken) -> Result<Box<dyn Connection>> {
        let mut guard = self.accept_rx.lock().await;
        let accept_rx = guard.as_mut().ok_or(Error::NotListening)?;
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
        Self::validate_endpoint(endpoint)?;
        if endpoint.port == 0 {
            return Err(Error::InvalidEndpoint("endpoint has no port".into()));
        }
        if self.close.is_cancelled() {
            return Err(Error::TransportClosed);
        }

        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| Error::InvalidEndpoint("endpoint has no IP".into()))?;
        let stream = tokio::select! {
            _ = token.cancelled() => return Err(Error::Canceled),
            _ = self.close.cancelled() => return Err(Error::TransportClosed),
            res = TcpStream::connect(addr) => res?,
        };
        let conn = TcpConnection::new(stream, self.options.max_frame_size, None)?;
        Ok(Box::new(conn))
    }

    fn endpoint(&self) -> Result<Endpoint> {
        self.listen_endpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotListening)
    }

    fn close(&self) {
        self.close.cancel();
    }
}

// =============================================================================
// Connection
// =============================================================================

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// One framed TCP connection. Holds its accept-cap permit (if inbound) until
/// closed, so closing it frees a slot for the next backlogged connection.
pub struct TcpConnection {
    sink: tokio::sync::Mutex<FrameSink>,
    stream: tokio::sync::Mutex<FrameStream>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    close: CancellationToken,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl TcpConnection {
    fn new(
        stream: TcpStream,
        max_frame_size: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (sink, stream) = Framed::new(stream, FrameCodec::new(max_frame_size)).split();
        Ok(TcpConnection {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            local_addr,
            remote_addr,
            close: CancellationToken::new(),
            permit: Mutex::new(permit),
        })
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut sink = self.sink.lock().await;
        tokio::select! {
            _ = self.close.cancelled() => Err(Error::ConnectionClosed),
            res = sink.send(frame) => res.map_err(Error::from),
        }
    }

    async fn receive_frame(&self, token: &CancellationToken) -> Result<Frame> {
        let mut stream = self.stream.lock().await;
        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            _ = self.close.cancelled() => Err(Error::ConnectionClosed),
            frame = stream.next() => match frame {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(e)) => Err(Error::Io(e)),
                None => Err(Error::ConnectionClosed),
            },
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn handshake(
        &self,
        token: &CancellationToken,
        local_info: NodeInfo,
    ) -> Result<NodeInfo> {
        self.send_frame(Frame::Handshake(local_info)).await?;
        match self.receive_frame(token).await? {
            Frame::Handshake(info) => Ok(info),
            Frame::Message { channel_id, .. } => Err(Error::Handshake(format!(
                "expected handshake frame, got message on channel {}",
                channel_id
            ))),
        }
    }

    async fn send_message(&self, channel_id: ChannelId, payload: Bytes) -> Result<()> {
        self.send_frame(Frame::Message { channel_id, payload }).await
    }

    async fn receive_message(&self, token: &CancellationToken) -> Result<(ChannelId, Bytes)> {
        match self.receive_frame(token).await? {
            Frame::Message { channel_id, payload } => Ok((channel_id, payload)),
            Frame::Handshake(_) => Err(Error::Protocol("unexpected handshake frame".into())),
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(Protocol::TCP, self.local_addr.ip(), self.local_addr.port())
    }

    fn remote_endpoint(&self) -> Endpoint {
        Endpoint::new(Protocol::TCP, self.remote_addr.ip(), self.remote_addr.port())
    }

    async fn close(&self) {
        self.close.cancel();
        // Shut down the write side so the peer observes EOF.
        if let Ok(mut sink) = self.sink.try_lock() {
            let _ = sink.close().await;
        }
        self.permit.lock().unwrap().take();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeId;
    use std::net::IpAddr;
    use std::time::Duration;

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes(&[byte; 20]).unwrap()
    }

    fn loopback() -> Endpoint {
        Endpoint::new(Protocol::TCP, IpAddr::from([127, 0, 0, 1]), 0)
    }

    #[test]
    fn test_frame_codec_message_roundtrip() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_SIZE);
        let frame = Frame::Message {
            channel_id: 0x05,
            payload: Bytes::from_static(b"block part"),
        };

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_codec_handshake_roundtrip() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_SIZE);
        let frame = Frame::Handshake(NodeInfo::new(node_id(7)).with_channels(vec![1, 2, 3]));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_frame_codec_rejects_bad_magic() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_SIZE);
        let mut buf = BytesMut::from(&b"nope\x00\x00\x00\x02\x01\x01"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_frame_codec_rejects_oversized() {
        let mut codec = FrameCodec::new(16);
        let frame = Frame::Message {
            channel_id: 0x01,
            payload: Bytes::from(vec![0u8; 64]),
        };
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_frame_codec_partial_input() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_SIZE);
        let frame = Frame::Message {
            channel_id: 0x01,
            payload: Bytes::from_static(b"partial"),
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_listen_validation() {
        for (endpoint, ok) in [
            (loopback(), true),
            (Endpoint::new(Protocol::TCP, IpAddr::from([0, 0, 0, 0]), 0), true),
            // Wrong protocol.
            (Endpoint::new(Protocol::MEMORY, IpAddr::from([127, 0, 0, 1]), 0), false),
            // Path on a network transport.
            (
                Endpoint {
                    protocol: Protocol::TCP,
                    ip: Some(IpAddr::from([127, 0, 0, 1])),
                    port: 0,
                    path: "foo".into(),
                },
                false,
            ),
            // No IP.
            (Endpoint::path_only(Protocol::TCP, "foo"), false),
        ] {
            let transport = TcpTransport::new(TcpTransportOptions::default());
            assert!(transport.endpoint().is_err());
            let res = transport.listen(endpoint.clone()).await;
            assert_eq!(res.is_ok(), ok, "{:?}", endpoint);
            if ok {
                let bound = transport.endpoint().unwrap();
                assert_ne!(bound.port, 0);
                // Listening twice fails.
                assert!(transport.listen(endpoint).await.is_err());
            }
            transport.close();
        }
    }

    #[tokio::test]
    async fn test_accept_before_listen() {
        let transport = TcpTransport::new(TcpTransportOptions::default());
        let token = CancellationToken::new();
        assert!(matches!(
            transport.accept(&token).await,
            Err(Error::NotListening)
        ));
    }

    #[tokio::test]
    async fn test_dial_accept_handshake() {
        let transport = TcpTransport::new(TcpTransportOptions::default());
        transport.listen(loopback()).await.unwrap();
        let endpoint = transport.endpoint().unwrap();
        let token = CancellationToken::new();

        let dialed = transport.dial(&token, &endpoint).await.unwrap();
        let accepted = transport.accept(&token).await.unwrap();
        assert_eq!(dialed.local_endpoint(), accepted.remote_endpoint());

        let t = token.clone();
        let accept_side = tokio::spawn(async move {
            let info = accepted
                .handshake(&t, NodeInfo::new(node_id(0x0b)))
                .await
                .unwrap();
            (accepted, info)
        });
        let info = dialed
            .handshake(&token, NodeInfo::new(node_id(0x0a)))
            .await
            .unwrap();
        assert_eq!(info.node_id, node_id(0x0b));
        let (accepted, info) = accept_side.await.unwrap();
        assert_eq!(info.node_id, node_id(0x0a));

        dialed
            .send_message(0x01, Bytes::from_static(b"vote"))
            .await
            .unwrap();
        let (channel_id, payload) = accepted.receive_message(&token).await.unwrap();
        assert_eq!(channel_id, 0x01);
        assert_eq!(payload, Bytes::from_static(b"vote"));

        // Closing one side fails the other side's next read.
        dialed.close().await;
        assert!(accepted.receive_message(&token).await.is_err());

        transport.close();
        assert!(transport.dial(&token, &endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_max_accepted_connections_backlog() {
        let transport = TcpTransport::new(TcpTransportOptions {
            max_accepted_connections: Some(2),
            ..Default::default()
        });
        transport.listen(loopback()).await.unwrap();
        let endpoint = transport.endpoint().unwrap();
        let token = CancellationToken::new();

        let _dial1 = transport.dial(&token, &endpoint).await.unwrap();
        let accept1 = transport.accept(&token).await.unwrap();
        let _dial2 = transport.dial(&token, &endpoint).await.unwrap();
        let _accept2 = transport.accept(&token).await.unwrap();

        // The third connection dials fine but is not surfaced.
        let _dial3 = transport.dial(&token, &endpoint).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), transport.accept(&token)).await;
        assert!(blocked.is_err(), "accept should not surface beyond the cap");

        // Closing an accepted connection frees a slot.
        accept1.close().await;
        let accept3 = tokio::time::timeout(Duration::from_secs(2), transport.accept(&token))
            .await
            .expect("accept did not surface after a slot freed up")
            .unwrap();
        assert_eq!(accept3.local_endpoint().protocol, Protocol::TCP);
    }
}
