//! meshlink - peer-to-peer encrypted overlay network
//!
//! Every node owns one private IPv4 address on a shared overlay network and
//! keeps a direct encrypted tunnel to each peer it talks to.
//!
//! # Layers
//!
//! - Handshake wire format and role-ordered exchange ([`protocol`])
//! - Per-peer encrypted forwarding loop ([`peer`])
//! - Private IP -> peer mapping ([`table`])
//! - Inbound accept loop ([`listener`]) and outbound dials ([`connector`])
//! - Packet routing from the local TUN device ([`router`])
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshlink::{LocalNode, MeshConfig, Node, TcpTransport, TunDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshlink::MeshError> {
//!     let config = MeshConfig::from_file("meshlink.conf")?;
//!     let device = TunDevice::create(config.interface.address, config.interface.mtu).await?;
//!     let local = LocalNode::from_config(&config.interface);
//!     let seeds = config.peers.iter().map(|p| p.endpoint).collect();
//!
//!     let node = Node::new(local, Arc::new(TcpTransport), Arc::new(device))
//!         .start(([0, 0, 0, 0], config.interface.listen_port).into(), seeds)
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod crypto;
pub mod device;
pub mod error;
pub mod listener;
pub mod net;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod table;
pub mod tunnel;

pub use config::MeshConfig;
pub use device::{MemoryDevice, PacketDevice};
pub use error::MeshError;
pub use listener::ListenerService;
pub use net::{Acceptor, BoxConnection, Connection, TcpTransport, Transport};
pub use node::{LocalNode, Node, RunningNode};
pub use peer::RemotePeer;
pub use protocol::Role;
pub use router::Router;
pub use table::PeerTable;
pub use tunnel::TunDevice;
