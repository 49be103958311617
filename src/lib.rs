//! Peernet: the p2p networking core of a replicated state machine
//!
//! This crate moves opaque message payloads between nodes over logical
//! channels, and manages the peer lifecycle around those connections:
//! - Address book with scoring, retry backoff, and sled persistence
//! - Pluggable transports (framed TCP, in-process memory for tests)
//! - Channel multiplexing with FIFO or priority queue scheduling
//! - Per-IP connection admission with a reconnect rate limit
//!
//! # Example
//!
//! ```rust,no_run
//! use peernet::channel::ChannelDescriptor;
//! use peernet::metrics::Metrics;
//! use peernet::peer::{PeerManager, PeerManagerOptions};
//! use peernet::router::{Router, RouterOptions};
//! use peernet::transport::tcp::{TcpTransport, TcpTransportOptions};
//! use peernet::transport::{NodeInfo, Transport};
//! use peernet::{Endpoint, NodeId, Protocol};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> peernet::Result<()> {
//! let node_id: NodeId = "1f".repeat(20).parse()?;
//! let transport = TcpTransport::new(TcpTransportOptions::default());
//! transport
//!     .listen(Endpoint::new(Protocol::TCP, [0, 0, 0, 0].into(), 26656))
//!     .await?;
//!
//! let db = sled::open("peers.db")?;
//! let peer_manager = Arc::new(PeerManager::new(
//!     db.open_tree("peers")?,
//!     PeerManagerOptions::default(),
//! )?);
//! let router = Router::new(
//!     NodeInfo::new(node_id),
//!     peer_manager.clone(),
//!     vec![Arc::new(transport)],
//!     Arc::new(Metrics::default()),
//!     RouterOptions::default(),
//! )?;
//!
//! let channel = router.open_channel(ChannelDescriptor::new(1, 5))?;
//! router.start()?;
//!
//! // Seed the address book; the router dials in the background.
//! peer_manager.add("tcp://aa...aa@validator.example.com:26656".parse()?)?;
//!
//! // Receive until shutdown.
//! let token = CancellationToken::new();
//! let mut iter = channel.receive();
//! while iter.next(&token).await {
//!     let envelope = iter.envelope().unwrap();
//!     println!("got {} bytes on channel {}", envelope.message.len(), envelope.channel_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod channel;
pub mod conn_tracker;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod queue;
pub mod router;
pub mod transport;

pub use address::{Endpoint, NodeAddress, NodeId, Protocol};
pub use channel::{Channel, ChannelDescriptor, ChannelId, Envelope, PeerStatus, PeerUpdate};
pub use error::{Error, Result};
pub use router::{Router, RouterOptions};
