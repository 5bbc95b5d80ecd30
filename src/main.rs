//! DHT node binary.
//!
//! Starts a node that serves the DHT and Source protocols, routes keys with a
//! Kademlia lookup over the peers given on the command line, and optionally
//! publishes a few values.
//!
//! # Usage
//!
//! ```bash
//! peer-dht --listen /ip4/127.0.0.1/tcp/4001 --seed alice
//! peer-dht --listen /ip4/127.0.0.1/tcp/4002 --seed bob \
//!     --peer <alice-peer-id>@/ip4/127.0.0.1/tcp/4001 --publish fish
//! ```
//!
//! A status line is logged every minute. Set `RUST_LOG=debug` to trace
//! individual exchanges.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peer_dht::core::blake3_digest;
use peer_dht::{Dht, KademliaLookup, NetAddr, Node, NodeConfig, PeerId};

#[derive(Debug, Parser)]
#[command(name = "peer-dht", about = "Run a peer-dht node")]
struct Args {
    /// Address to listen on, `/ip4/<ip>/tcp/<port>` or `<ip>:<port>`.
    #[arg(long, default_value = "/ip4/127.0.0.1/tcp/0")]
    listen: NetAddr,

    /// Seed for a deterministic private key; random when omitted.
    #[arg(long)]
    seed: Option<String>,

    /// Known peer as `<peer_id>@<addr>`. Repeatable.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(PeerId, NetAddr)>,

    /// JSON file with node configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Text to publish once the node is up. Repeatable.
    #[arg(long)]
    publish: Vec<String>,
}

fn parse_peer(s: &str) -> Result<(PeerId, NetAddr)> {
    let (id, addr) = s
        .split_once('@')
        .context("expected <peer_id>@<addr>")?;
    Ok((id.parse()?, addr.parse()?))
}

/// Log a status line every `period`.
fn spawn_status(
    lookup: Arc<KademliaLookup>,
    dht: Arc<Dht>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        loop {
            interval.tick().await;
            let known_peers = lookup.peer_count().await;
            let stored_keys = dht.stored_keys().await;
            let published_keys = dht.published_keys().await;
            info!(known_peers, stored_keys, published_keys, "status");
        }
    })
}

fn private_key(seed: Option<&str>) -> [u8; 32] {
    match seed {
        Some(seed) => blake3_digest(seed.as_bytes()),
        None => rand::random(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            NodeConfig::from_json(&json)?
        }
        None => NodeConfig::default(),
    };
    let bucket_size = config.bucket_size;

    let key = private_key(args.seed.as_deref());
    let node = Node::with_config(args.listen, &key, config).await?;
    info!(peer = %node.peer_id(), addr = %node.net_addr(), "node started");

    let lookup = Arc::new(KademliaLookup::new(node.peer_id(), bucket_size));
    for (peer, addr) in &args.peers {
        node.add_peer(*peer, *addr).await;
        lookup.observe(*peer).await;
    }

    let dht = Dht::new(&node, lookup.clone());
    node.start_dht(&dht).await?;
    node.start_src(&dht).await?;

    for text in &args.publish {
        match dht.publish(text.clone().into_bytes()).await {
            Ok(key) => info!(key = %key, "published"),
            Err(err) => warn!(%err, text = %text, "publish failed"),
        }
    }

    spawn_status(lookup, dht, Duration::from_secs(60));

    // Park the main task; the node serves requests in the background.
    future::pending::<()>().await;
    Ok(())
}
