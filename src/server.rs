//! Inbound side of the transport: protocol bindings and stream handling.
//!
//! A [`ProtocolBinding`] maps the message types a protocol accepts to their
//! [`MessageHandler`]s. The set of routed types is the protocol's whitelist;
//! anything else is answered with an ERROR_RESPONSE instead of being dropped.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::core::PeerId;
use crate::error::{Error, Result};
use crate::framing::{read_frame, write_frame};
use crate::net::NodeInner;
use crate::protocol::{Message, MsgType, Negotiation, Protocol, StreamHello};

/// Handles one message type within a protocol.
///
/// An `Err` is not fatal: the registry turns it into an ERROR_RESPONSE carrying
/// the error's text.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, from: PeerId, msg: Message) -> Result<Message>;
}

/// The handlers registered for one logical protocol.
pub struct ProtocolBinding {
    protocol: Protocol,
    handlers: HashMap<MsgType, Arc<dyn MessageHandler>>,
}

impl fmt::Debug for ProtocolBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolBinding")
            .field("protocol", &self.protocol)
            .field("whitelist", &self.whitelist())
            .finish()
    }
}

impl ProtocolBinding {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            handlers: HashMap::new(),
        }
    }

    /// Accept `msg_type` on this protocol and route it to `handler`.
    pub fn route(mut self, msg_type: MsgType, handler: impl MessageHandler) -> Self {
        self.handlers.insert(msg_type, Arc::new(handler));
        self
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn accepts(&self, msg_type: MsgType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// The accepted message types, in code order.
    pub fn whitelist(&self) -> Vec<MsgType> {
        let mut types: Vec<MsgType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Produce the response for one inbound message. Never fails: rejections
    /// and handler errors become ERROR_RESPONSE.
    pub async fn dispatch(&self, from: PeerId, msg: Message) -> Message {
        let msg_type = msg.msg_type();
        let Some(handler) = self.handlers.get(&msg_type) else {
            let err = Error::UnsupportedMessageType {
                msg_type,
                protocol: self.protocol.name.to_string(),
            };
            debug!(peer = %from, protocol = %self.protocol, %err, "message rejected");
            return Message::error(err.to_string());
        };

        match handler.handle(from, msg).await {
            Ok(response) => response,
            Err(err) => {
                debug!(peer = %from, protocol = %self.protocol, %err, "handler failed");
                Message::error(err.to_string())
            }
        }
    }
}

/// Accept streams until the listener task is aborted or the node is dropped.
///
/// Stream tasks hold only a weak reference to the node and are bounded by the
/// request timeout.
pub(crate) async fn accept_loop(node: Weak<NodeInner>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let (max, deadline) = match node.upgrade() {
            Some(inner) => (inner.config.max_frame_size, inner.config.request_timeout()),
            None => break,
        };
        let node = node.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, handle_stream(node, stream, remote, max)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%remote, %err, "inbound stream failed"),
                Err(_) => debug!(%remote, ?deadline, "inbound stream timed out"),
            }
        });
    }
}

/// Serve exactly one exchange on an accepted stream.
async fn handle_stream(
    node: Weak<NodeInner>,
    mut stream: TcpStream,
    remote: SocketAddr,
    max: usize,
) -> Result<()> {
    let Some(hello) = read_frame(&mut stream, max).await? else {
        return Ok(());
    };
    let hello: StreamHello = serde_json::from_slice(&hello)?;

    let (negotiation, binding) = {
        let node = node.upgrade().ok_or(Error::Closed)?;
        if hello.to != node.peer_id {
            (Negotiation::WrongPeer, None)
        } else {
            match node.registry.read().await.get(&hello.protocol).cloned() {
                Some(binding) => (Negotiation::Accepted, Some(binding)),
                None => (Negotiation::Unsupported, None),
            }
        }
    };
    write_frame(&mut stream, &serde_json::to_vec(&negotiation)?, max).await?;

    let Some(binding) = binding else {
        debug!(
            peer = %hello.from,
            %remote,
            protocol = %hello.protocol,
            ?negotiation,
            "stream refused"
        );
        stream.shutdown().await?;
        return Ok(());
    };

    let request = read_frame(&mut stream, max)
        .await?
        .ok_or_else(|| Error::Transport(format!("{} closed the stream before sending", hello.from)))?;
    let response = match Message::decode(&request) {
        Ok(msg) => {
            debug!(peer = %hello.from, protocol = %hello.protocol, request = %msg, "inbound request");
            binding.dispatch(hello.from, msg).await
        }
        Err(err) => Message::error(format!("malformed message: {err}")),
    };

    write_frame(&mut stream, &response.encode()?, max).await?;
    stream.shutdown().await?;
    Ok(())
}
