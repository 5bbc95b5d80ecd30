//! Peer-addressable transport over TCP.
//!
//! A [`Node`] owns a listening socket, an address book keyed by [`PeerId`], and
//! a registry of protocol bindings. Each [`Node::send`] opens one stream,
//! negotiates a protocol, and performs exactly one request/response exchange:
//!
//! ```text
//! opener                          acceptor
//!   | -- StreamHello ------------->  |
//!   | <------------- Negotiation --  |
//!   | -- request Message --------->  |
//!   | <---------- response Message - |  (then shutdown)
//! ```
//!
//! Every frame is length prefixed, see [`crate::framing`].

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::core::PeerId;
use crate::dht::Dht;
use crate::error::{Error, Result};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Message, Negotiation, Protocol, StreamHello};
use crate::server::{accept_loop, ProtocolBinding};

/// A TCP endpoint, rendered in multiaddr form (`/ip4/127.0.0.1/tcp/1234`).
///
/// Parsing accepts the multiaddr form as well as plain `ip:port`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr(SocketAddr);

impl NetAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.ip() {
            IpAddr::V4(ip) => write!(f, "/ip4/{ip}/tcp/{}", self.0.port()),
            IpAddr::V6(ip) => write!(f, "/ip6/{ip}/tcp/{}", self.0.port()),
        }
    }
}

impl fmt::Debug for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetAddr({self})")
    }
}

impl FromStr for NetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Parse(format!("invalid address {s:?}"));
        if !s.starts_with('/') {
            return s.parse::<SocketAddr>().map(Self).map_err(|_| invalid());
        }

        let parts: Vec<&str> = s[1..].split('/').collect();
        let [family, ip, "tcp", port] = parts.as_slice() else {
            return Err(invalid());
        };
        let ip: IpAddr = match *family {
            "ip4" => IpAddr::V4(ip.parse().map_err(|_| invalid())?),
            "ip6" => IpAddr::V6(ip.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        };
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(Self(SocketAddr::new(ip, port)))
    }
}

impl Serialize for NetAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Shared state behind every [`Node`] handle.
pub(crate) struct NodeInner {
    pub(crate) peer_id: PeerId,
    pub(crate) net_addr: NetAddr,
    pub(crate) config: NodeConfig,
    peers: RwLock<HashMap<PeerId, NetAddr>>,
    /// Protocol id -> binding.
    pub(crate) registry: RwLock<HashMap<String, Arc<ProtocolBinding>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

/// A peer on the network.
///
/// Cloning is cheap; all clones share one listener, address book, and
/// registry. The listener stops on [`close`](Self::close) or when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.inner.peer_id)
            .field("net_addr", &self.inner.net_addr)
            .finish()
    }
}

impl Node {
    /// Bind `listen` with the default configuration.
    pub async fn new(listen: NetAddr, private_key: &[u8]) -> Result<Self> {
        Self::with_config(listen, private_key, NodeConfig::default()).await
    }

    /// Derive the peer id from `private_key`, bind `listen`, and start
    /// accepting streams. Port 0 binds an ephemeral port; [`net_addr`]
    /// reports the one actually bound.
    ///
    /// [`net_addr`]: Self::net_addr
    pub async fn with_config(
        listen: NetAddr,
        private_key: &[u8],
        config: NodeConfig,
    ) -> Result<Self> {
        let bind_err = |reason: String| Error::Bind {
            addr: listen.to_string(),
            reason,
        };
        let peer_id = PeerId::from_private_key(private_key).map_err(|e| bind_err(e.to_string()))?;
        let listener = TcpListener::bind(listen.socket_addr())
            .await
            .map_err(|e| bind_err(e.to_string()))?;
        let net_addr = NetAddr(listener.local_addr().map_err(|e| bind_err(e.to_string()))?);

        let inner = Arc::new(NodeInner {
            peer_id,
            net_addr,
            config,
            peers: RwLock::new(HashMap::from([(peer_id, net_addr)])),
            registry: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let handle = tokio::spawn(accept_loop(Arc::downgrade(&inner), listener));
        *inner.listener.lock().await = Some(handle);

        info!(peer = %peer_id, addr = %net_addr, "node listening");
        Ok(Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Arc::downgrade(&self.inner)
    }

    /// Recover a handle from a weak reference, failing once the node is gone.
    pub(crate) fn upgrade(weak: &Weak<NodeInner>) -> Result<Self> {
        let inner = weak.upgrade().ok_or(Error::Closed)?;
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// The address the listener is bound to.
    pub fn net_addr(&self) -> NetAddr {
        self.inner.net_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Record (or replace) the address of a peer.
    pub async fn add_peer(&self, peer: PeerId, addr: NetAddr) {
        debug!(peer = %peer, addr = %addr, "address book updated");
        self.inner.peers.write().await.insert(peer, addr);
    }

    /// Forget a peer's address. Returns the address it had, if any.
    pub async fn remove_peer(&self, peer: &PeerId) -> Option<NetAddr> {
        self.inner.peers.write().await.remove(peer)
    }

    pub async fn peer_addr(&self, peer: &PeerId) -> Option<NetAddr> {
        self.inner.peers.read().await.get(peer).copied()
    }

    /// Register a protocol binding, replacing any previous binding for the
    /// same protocol id.
    pub async fn register(&self, binding: ProtocolBinding) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let id = binding.protocol().id.to_string();
        debug!(
            peer = %self.inner.peer_id,
            protocol = %id,
            whitelist = ?binding.whitelist(),
            "protocol registered"
        );
        self.inner.registry.write().await.insert(id, Arc::new(binding));
        Ok(())
    }

    /// Serve the DHT protocol (PUT_REQUEST, GET_REQUEST) from `dht`.
    pub async fn start_dht(&self, dht: &Arc<Dht>) -> Result<()> {
        self.register(dht.dht_binding()).await
    }

    /// Serve the Source protocol (SRC_VALIDATE) from `dht`.
    pub async fn start_src(&self, dht: &Arc<Dht>) -> Result<()> {
        self.register(dht.source_binding()).await
    }

    /// Send `msg` to `peer` under `protocol` and wait for the response,
    /// bounded by the configured request timeout.
    pub async fn send(&self, protocol: &Protocol, peer: PeerId, msg: &Message) -> Result<Message> {
        self.send_with_timeout(protocol, peer, msg, self.inner.config.request_timeout())
            .await
    }

    pub async fn send_with_timeout(
        &self,
        protocol: &Protocol,
        peer: PeerId,
        msg: &Message,
        timeout: Duration,
    ) -> Result<Message> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let addr = self
            .peer_addr(&peer)
            .await
            .ok_or_else(|| Error::Transport(format!("no address for peer {peer}")))?;

        match tokio::time::timeout(timeout, self.exchange(protocol, peer, addr, msg)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!(
                "request to {peer} timed out after {timeout:?}"
            ))),
        }
    }

    async fn exchange(
        &self,
        protocol: &Protocol,
        peer: PeerId,
        addr: NetAddr,
        msg: &Message,
    ) -> Result<Message> {
        let max = self.inner.config.max_frame_size;
        let request = msg.encode()?;

        let mut stream = TcpStream::connect(addr.socket_addr()).await?;
        let hello = StreamHello {
            protocol: protocol.id.to_string(),
            from: self.inner.peer_id,
            to: peer,
        };
        write_frame(&mut stream, &serde_json::to_vec(&hello)?, max).await?;

        let reply = read_frame(&mut stream, max)
            .await?
            .ok_or_else(|| Error::Transport(format!("{peer} closed the stream during negotiation")))?;
        match serde_json::from_slice::<Negotiation>(&reply)? {
            Negotiation::Accepted => {}
            Negotiation::Unsupported => {
                return Err(Error::Protocol {
                    protocol: protocol.id.to_string(),
                    peer,
                })
            }
            Negotiation::WrongPeer => {
                return Err(Error::Transport(format!(
                    "{addr} is not the address of peer {peer}"
                )))
            }
        }

        write_frame(&mut stream, &request, max).await?;
        let response = read_frame(&mut stream, max)
            .await?
            .ok_or_else(|| Error::Transport(format!("{peer} closed the stream before responding")))?;
        let response = Message::decode(&response)?;
        debug!(
            peer = %peer,
            protocol = %protocol,
            request = %msg,
            response = %response,
            "exchange complete"
        );
        Ok(response)
    }

    /// Stop accepting streams and drop every protocol binding.
    ///
    /// Returns once the listening socket is released, so the address can be
    /// bound again immediately. Calling it more than once is a no-op.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let handle = self.inner.listener.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!(peer = %self.inner.peer_id, addr = %self.inner.net_addr, "node closed");
        }
        self.inner.registry.write().await.clear();
    }
}
