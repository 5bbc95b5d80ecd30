//! Error types for the messaging layer and the DHT.

use thiserror::Error;

use crate::core::{Hash, PeerId};
use crate::protocol::MsgType;

/// The result for node, protocol, and DHT operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the crate.
///
/// Network-facing failures are always returned to the immediate caller. The
/// only error that never reaches a local caller is
/// [`Error::UnsupportedMessageType`]: the handler registry converts it into an
/// ERROR_RESPONSE so the remote peer observes it.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire bytes were truncated, malformed, or carried a body that does not
    /// match the declared message type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer is unknown or unreachable, the stream closed early, or the
    /// exchange timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote peer has no handler registered for the protocol.
    #[error("peer {peer} does not support protocol {protocol}")]
    Protocol {
        /// Protocol identifier that was requested.
        protocol: String,
        /// Peer that refused the protocol.
        peer: PeerId,
    },

    /// The message type is not in the protocol's whitelist.
    #[error("message type {msg_type} not in {protocol} protocol")]
    UnsupportedMessageType {
        /// The rejected type.
        msg_type: MsgType,
        /// Human readable protocol name.
        protocol: String,
    },

    /// The key is not present in the local store.
    #[error("no key: {0}")]
    NotFound(Hash),

    /// No responsible peer could be determined for a key.
    #[error("routing error: {0}")]
    Routing(String),

    /// The listen address could not be bound or the private key is malformed.
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        /// Requested listen address.
        addr: String,
        /// Underlying cause.
        reason: String,
    },

    /// A textual address, peer id, hash, or key could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A stored value does not hash to the key it was offered under.
    #[error("value does not match key {0}")]
    InvalidValue(Hash),

    /// The remote peer answered with an ERROR_RESPONSE.
    #[error("remote error: {0}")]
    Remote(String),

    /// The remote peer answered with a message of an unexpected type.
    #[error("unexpected response type {0}")]
    UnexpectedResponse(MsgType),

    /// The node has been closed.
    #[error("node is closed")]
    Closed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
