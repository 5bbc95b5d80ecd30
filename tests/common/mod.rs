#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;

use peer_dht::core::{blake3_digest, xor_distance};
use peer_dht::{Dht, Hash, KademliaLookup, NetAddr, Node, NodeConfig, PeerId};

/// A node bound to an ephemeral localhost port with both protocols started.
pub struct TestNode {
    pub node: Node,
    pub dht: Arc<Dht>,
    pub lookup: Arc<KademliaLookup>,
}

impl TestNode {
    pub async fn new(index: u32) -> Self {
        Self::with_config(index, NodeConfig::default())
            .await
            .expect("test node starts")
    }

    pub async fn with_config(index: u32, config: NodeConfig) -> Result<Self> {
        let bucket_size = config.bucket_size;
        let node = make_node(index, config).await?;
        let lookup = Arc::new(KademliaLookup::new(node.peer_id(), bucket_size));
        let dht = Dht::new(&node, lookup.clone());
        node.start_dht(&dht).await?;
        node.start_src(&dht).await?;
        Ok(Self { node, dht, lookup })
    }

    pub fn id(&self) -> PeerId {
        self.node.peer_id()
    }

    /// Make `other` reachable and routable from this node.
    pub async fn learn(&self, other: &TestNode) {
        self.node.add_peer(other.id(), other.node.net_addr()).await;
        self.lookup.observe(other.id()).await;
    }

    /// Drop `other` from the address book and the routing table.
    pub async fn forget(&self, other: &TestNode) {
        self.node.remove_peer(&other.id()).await;
        self.lookup.forget(&other.id()).await;
    }
}

/// Deterministic private key for a test index.
pub fn make_key(index: u32) -> [u8; 32] {
    blake3_digest(format!("test-node-{index}").as_bytes())
}

/// Bind a bare node (no protocols started) on `127.0.0.1:0`.
pub async fn make_node(index: u32, config: NodeConfig) -> Result<Node> {
    let listen: NetAddr = "/ip4/127.0.0.1/tcp/0".parse()?;
    Ok(Node::with_config(listen, &make_key(index), config).await?)
}

/// Peer id whose first byte is `byte` and the rest zero.
pub fn make_peer_id(byte: u8) -> PeerId {
    let mut id = [0u8; 32];
    id[0] = byte;
    PeerId::from_bytes(id)
}

/// The candidate with the smallest XOR distance to `key`.
pub fn nearest(key: &Hash, candidates: &[PeerId]) -> PeerId {
    *candidates
        .iter()
        .min_by_key(|id| xor_distance(id.as_bytes(), key.as_bytes()))
        .expect("at least one candidate")
}

/// First value `value-<n>` whose key satisfies `pred`.
pub fn find_value(pred: impl Fn(&Hash) -> bool) -> Vec<u8> {
    (0u32..)
        .map(|n| format!("value-{n}").into_bytes())
        .find(|value| pred(&Hash::digest(value)))
        .expect("some value matches")
}
