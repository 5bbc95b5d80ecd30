//! # peer-dht
//!
//! A peer-addressable messaging layer with a small content-addressed DHT on
//! top. Nodes exchange typed request/response [`Message`]s with specific peers
//! over named logical protocols, and the [`Dht`] routes storage requests for a
//! content [`Hash`] to whichever peer a [`NodeLookup`] says is responsible.
//!
//! The crate is split into modules that can be used independently:
//!
//! - [`core`]: hashes, peer identities, XOR distance, the routing table, and
//!   the [`NodeLookup`] strategies.
//! - [`protocol`]: the [`Message`] envelope, its binary encoding, and the
//!   built-in protocol identifiers.
//! - [`framing`]: length-prefixed frames over any async byte stream.
//! - [`net`]: the TCP [`Node`] with its address book and [`Node::send`].
//! - [`server`]: protocol bindings, whitelist enforcement, inbound streams.
//! - [`dht`]: put/get over the DHT protocol and source validation.
//! - [`config`]: tunables loadable from JSON.
//!
//! ## Getting started
//!
//! ```no_run
//! use peer_dht::{Dht, Hash, Node, Result};
//!
//! # async fn launch() -> Result<()> {
//! let node = Node::new("127.0.0.1:4001".parse()?, &[7u8; 32]).await?;
//! let dht = Dht::single_node(&node);
//! node.start_dht(&dht).await?;
//! node.start_src(&dht).await?;
//!
//! let key = dht.publish(b"fish".to_vec()).await?;
//! assert_eq!(key, Hash::digest(b"fish"));
//! assert_eq!(dht.get(&key).await?, b"fish");
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a runnable node.

pub mod config;
pub mod core;
pub mod dht;
pub mod error;
pub mod framing;
pub mod net;
pub mod protocol;
pub mod server;

pub use crate::config::NodeConfig;
pub use crate::core::{Hash, KademliaLookup, NodeLookup, PeerId, RoutingTable, SelfLookup};
pub use crate::dht::Dht;
pub use crate::error::{Error, Result};
pub use crate::net::{NetAddr, Node};
pub use crate::protocol::{Message, MsgType, Protocol, PutRequest, DHT_PROTOCOL, SOURCE_PROTOCOL};
pub use crate::server::{MessageHandler, ProtocolBinding};
