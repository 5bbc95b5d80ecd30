//! Content-addressed storage routed to the responsible peer.
//!
//! A [`Dht`] keeps two maps keyed by the hex form of a [`Hash`]:
//!
//! - `sources`: content this node authored and is prepared to push;
//! - `store`: content this node is responsible for, written only by inbound
//!   PUT_REQUESTs.
//!
//! Responsibility is decided by the pluggable [`NodeLookup`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::{Hash, NodeLookup, PeerId, SelfLookup};
use crate::error::{Error, Result};
use crate::net::{Node, NodeInner};
use crate::protocol::{Message, MsgType, PutRequest, DHT_PROTOCOL, SOURCE_PROTOCOL};
use crate::server::{MessageHandler, ProtocolBinding};

pub struct Dht {
    owner: Weak<NodeInner>,
    self_id: PeerId,
    store: RwLock<HashMap<String, Vec<u8>>>,
    sources: RwLock<HashMap<String, Vec<u8>>>,
    lookup: Arc<dyn NodeLookup>,
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht").field("self_id", &self.self_id).finish()
    }
}

impl Dht {
    /// Attach a DHT to `node`. The DHT does not keep the node alive.
    pub fn new(node: &Node, lookup: Arc<dyn NodeLookup>) -> Arc<Self> {
        Arc::new(Self {
            owner: node.downgrade(),
            self_id: node.peer_id(),
            store: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            lookup,
        })
    }

    /// A DHT that considers this node responsible for every key.
    pub fn single_node(node: &Node) -> Arc<Self> {
        Self::new(node, Arc::new(SelfLookup::new(node.peer_id())))
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    fn node(&self) -> Result<Node> {
        Node::upgrade(&self.owner)
    }

    pub async fn find_node_for_hash(&self, key: &Hash) -> Result<PeerId> {
        self.lookup.find_node_for_hash(key).await
    }

    /// Record `value` as authored here and push it to the responsible peer.
    pub async fn publish(&self, value: Vec<u8>) -> Result<Hash> {
        let key = Hash::digest(&value);
        self.sources.write().await.insert(key.to_string(), value);
        self.put(&key).await?;
        Ok(key)
    }

    /// Push locally authored content for `key` to the peer responsible for it.
    ///
    /// Fails with [`Error::NotFound`] before any routing when this node never
    /// published content for `key`. Otherwise returns the lookup or send
    /// error unchanged.
    ///
    /// The local `store` is never touched here; it changes only when this
    /// node receives the PUT_REQUEST, which happens when it is the
    /// responsible peer.
    pub async fn put(&self, key: &Hash) -> Result<()> {
        let value = self
            .sources
            .read()
            .await
            .get(&key.to_string())
            .cloned()
            .ok_or(Error::NotFound(*key))?;
        let target = self.find_node_for_hash(key).await?;
        let node = self.node()?;

        debug!(key = %key, target = %target, "routing put");
        let request = Message::PutRequest(PutRequest { key: *key, value });
        match node.send(&DHT_PROTOCOL, target, &request).await? {
            Message::OkResponse => Ok(()),
            Message::ErrorResponse(reason) => Err(Error::Remote(reason)),
            other => Err(Error::UnexpectedResponse(other.msg_type())),
        }
    }

    /// Read from the local store only.
    pub async fn get(&self, key: &Hash) -> Result<Vec<u8>> {
        self.store
            .read()
            .await
            .get(&key.to_string())
            .cloned()
            .ok_or(Error::NotFound(*key))
    }

    /// Read `key` from the responsible peer, verifying the value.
    ///
    /// Served from the local store when this node is responsible.
    pub async fn fetch(&self, key: &Hash) -> Result<Vec<u8>> {
        let target = self.find_node_for_hash(key).await?;
        if target == self.self_id {
            return self.get(key).await;
        }

        let node = self.node()?;
        debug!(key = %key, target = %target, "fetching");
        match node.send(&DHT_PROTOCOL, target, &Message::GetRequest(*key)).await? {
            Message::ValueResponse(value) if key.verify(&value) => Ok(value),
            Message::ValueResponse(_) => Err(Error::InvalidValue(*key)),
            Message::ErrorResponse(reason) => Err(remote_error(key, reason)),
            other => Err(Error::UnexpectedResponse(other.msg_type())),
        }
    }

    /// Ask `peer` whether it authored the content for `key`.
    pub async fn validate_source(&self, peer: PeerId, key: &Hash) -> Result<bool> {
        let node = self.node()?;
        match node.send(&SOURCE_PROTOCOL, peer, &Message::SrcValidate(*key)).await? {
            Message::OkResponse => Ok(true),
            Message::ErrorResponse(reason) => match remote_error(key, reason) {
                Error::NotFound(_) => Ok(false),
                err => Err(err),
            },
            other => Err(Error::UnexpectedResponse(other.msg_type())),
        }
    }

    /// Number of entries this node is responsible for.
    pub async fn stored_keys(&self) -> usize {
        self.store.read().await.len()
    }

    /// Number of entries this node authored.
    pub async fn published_keys(&self) -> usize {
        self.sources.read().await.len()
    }

    async fn handle_put(&self, from: PeerId, key: Hash, value: Vec<u8>) -> Result<()> {
        if !key.verify(&value) {
            return Err(Error::InvalidValue(key));
        }
        debug!(peer = %from, key = %key, bytes = value.len(), "storing value");
        self.store.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn handle_src_validate(&self, key: &Hash) -> Result<()> {
        if self.sources.read().await.contains_key(&key.to_string()) {
            Ok(())
        } else {
            Err(Error::NotFound(*key))
        }
    }

    /// Binding for the DHT protocol: PUT_REQUEST and GET_REQUEST.
    pub fn dht_binding(self: &Arc<Self>) -> ProtocolBinding {
        ProtocolBinding::new(DHT_PROTOCOL)
            .route(MsgType::PutRequest, PutHandler(self.clone()))
            .route(MsgType::GetRequest, GetHandler(self.clone()))
    }

    /// Binding for the Source protocol: SRC_VALIDATE.
    pub fn source_binding(self: &Arc<Self>) -> ProtocolBinding {
        ProtocolBinding::new(SOURCE_PROTOCOL)
            .route(MsgType::SrcValidate, SrcValidateHandler(self.clone()))
    }
}

/// Map an ERROR_RESPONSE back to `NotFound` when it is the remote's "no key"
/// answer for `key`.
fn remote_error(key: &Hash, reason: String) -> Error {
    if reason == Error::NotFound(*key).to_string() {
        Error::NotFound(*key)
    } else {
        Error::Remote(reason)
    }
}

fn unexpected(msg_type: MsgType, protocol: &str) -> Error {
    Error::UnsupportedMessageType {
        msg_type,
        protocol: protocol.to_string(),
    }
}

struct PutHandler(Arc<Dht>);

#[async_trait]
impl MessageHandler for PutHandler {
    async fn handle(&self, from: PeerId, msg: Message) -> Result<Message> {
        match msg {
            Message::PutRequest(PutRequest { key, value }) => {
                self.0.handle_put(from, key, value).await?;
                Ok(Message::OkResponse)
            }
            other => Err(unexpected(other.msg_type(), DHT_PROTOCOL.name)),
        }
    }
}

struct GetHandler(Arc<Dht>);

#[async_trait]
impl MessageHandler for GetHandler {
    async fn handle(&self, _from: PeerId, msg: Message) -> Result<Message> {
        match msg {
            Message::GetRequest(key) => Ok(Message::ValueResponse(self.0.get(&key).await?)),
            other => Err(unexpected(other.msg_type(), DHT_PROTOCOL.name)),
        }
    }
}

struct SrcValidateHandler(Arc<Dht>);

#[async_trait]
impl MessageHandler for SrcValidateHandler {
    async fn handle(&self, _from: PeerId, msg: Message) -> Result<Message> {
        match msg {
            Message::SrcValidate(key) => {
                self.0.handle_src_validate(&key).await?;
                Ok(Message::OkResponse)
            }
            other => Err(unexpected(other.msg_type(), SOURCE_PROTOCOL.name)),
        }
    }
}
