//! Wire message definitions.
//!
//! This module defines the typed [`Message`] envelope exchanged between peers,
//! its binary encoding, and the logical protocols it travels over.
//!
//! # Encoding
//!
//! ```text
//! +----------+---------------------------+
//! | msg_type | body                      |
//! | 1 byte   | JSON, shape fixed by type |
//! +----------+---------------------------+
//! ```
//!
//! The tag byte is the [`MsgType`] code. The numbering is part of the wire
//! schema and must only change together with the protocol versions.
//!
//! Byte payloads travel as hex strings, so a frame carries roughly twice the
//! payload size: with the default 1 MiB frame cap, values up to about 512 KiB
//! fit in one PUT_REQUEST.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Hash, PeerId};
use crate::error::{Error, Result};

/// A named logical channel multiplexed over the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Protocol {
    /// Identifier negotiated when a stream is opened.
    pub id: &'static str,
    /// Short name used in diagnostics.
    pub name: &'static str,
}

impl Protocol {
    pub const fn new(id: &'static str, name: &'static str) -> Self {
        Self { id, name }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id)
    }
}

/// Protocol used to route storage requests between DHT peers.
pub const DHT_PROTOCOL: Protocol = Protocol::new("/holochain-dht/0.0.0", "holochain-dht");

/// Protocol used to ask a peer about content it authored.
pub const SOURCE_PROTOCOL: Protocol = Protocol::new("/holochain-src/0.0.0", "holochain-src");

/// Message type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MsgType {
    /// The request failed; the body describes why.
    ErrorResponse = 0,
    /// The request succeeded and carries no payload.
    OkResponse = 1,
    /// Ask the responsible peer to store a key/value pair.
    PutRequest = 2,
    /// Ask a peer for the value stored under a key.
    GetRequest = 3,
    /// Ask a peer whether it authored the content behind a key.
    SrcValidate = 4,
    /// A stored value.
    ValueResponse = 5,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::ErrorResponse),
            1 => Ok(Self::OkResponse),
            2 => Ok(Self::PutRequest),
            3 => Ok(Self::GetRequest),
            4 => Ok(Self::SrcValidate),
            5 => Ok(Self::ValueResponse),
            _ => Err(Error::Decode(format!("unknown message type {value}"))),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> Self {
        value as u8
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Body of a PUT_REQUEST.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    /// Key the value is stored under.
    pub key: Hash,
    /// The content; must hash to `key`.
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

/// Serde adapter carrying bytes as a hex string.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// A typed request or response.
///
/// Each variant carries the one body shape its [`MsgType`] accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ErrorResponse(String),
    OkResponse,
    PutRequest(PutRequest),
    GetRequest(Hash),
    SrcValidate(Hash),
    ValueResponse(Vec<u8>),
}

impl Message {
    /// The type tag of this message.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::ErrorResponse(_) => MsgType::ErrorResponse,
            Message::OkResponse => MsgType::OkResponse,
            Message::PutRequest(_) => MsgType::PutRequest,
            Message::GetRequest(_) => MsgType::GetRequest,
            Message::SrcValidate(_) => MsgType::SrcValidate,
            Message::ValueResponse(_) => MsgType::ValueResponse,
        }
    }

    /// Convenience constructor for ERROR_RESPONSE.
    pub fn error(reason: impl Into<String>) -> Self {
        Message::ErrorResponse(reason.into())
    }

    /// Encode to the tag byte followed by the JSON body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![u8::from(self.msg_type())];
        match self {
            Message::ErrorResponse(reason) => serde_json::to_writer(&mut buf, reason)?,
            Message::OkResponse => serde_json::to_writer(&mut buf, &())?,
            Message::PutRequest(req) => serde_json::to_writer(&mut buf, req)?,
            Message::GetRequest(key) | Message::SrcValidate(key) => {
                serde_json::to_writer(&mut buf, key)?
            }
            Message::ValueResponse(value) => serde_json::to_writer(&mut buf, &hex::encode(value))?,
        }
        Ok(buf)
    }

    /// Decode bytes produced by [`encode`](Self::encode).
    ///
    /// Fails with [`Error::Decode`] on empty or truncated input, an unknown
    /// tag, or a body whose shape does not belong to the tag.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Decode("empty message".to_string()))?;
        let msg = match MsgType::try_from(tag)? {
            MsgType::ErrorResponse => Message::ErrorResponse(decode_body(tag, body)?),
            MsgType::OkResponse => {
                decode_body::<()>(tag, body)?;
                Message::OkResponse
            }
            MsgType::PutRequest => Message::PutRequest(decode_body(tag, body)?),
            MsgType::GetRequest => Message::GetRequest(decode_body(tag, body)?),
            MsgType::SrcValidate => Message::SrcValidate(decode_body(tag, body)?),
            MsgType::ValueResponse => {
                let text: String = decode_body(tag, body)?;
                let value = hex::decode(text)
                    .map_err(|e| Error::Decode(format!("body of message type {tag}: {e}")))?;
                Message::ValueResponse(value)
            }
        };
        Ok(msg)
    }
}

fn decode_body<T: DeserializeOwned>(tag: u8, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::Decode(format!("body of message type {tag}: {e}")))
}

/// Renders as `{<type> <body>}`. A PUT_REQUEST shows its value as (lossy)
/// UTF-8 text.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.msg_type();
        match self {
            Message::ErrorResponse(reason) => write!(f, "{{{code} {reason}}}"),
            Message::OkResponse => write!(f, "{{{code} <nil>}}"),
            Message::PutRequest(req) => {
                write!(f, "{{{code} {}}}", String::from_utf8_lossy(&req.value))
            }
            Message::GetRequest(key) | Message::SrcValidate(key) => write!(f, "{{{code} {key}}}"),
            Message::ValueResponse(value) => write!(f, "{{{code} {} bytes}}", value.len()),
        }
    }
}

/// First frame on every stream, sent by the opener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHello {
    /// Protocol identifier, e.g. `/holochain-dht/0.0.0`.
    pub protocol: String,
    pub from: PeerId,
    /// The peer the opener believes it dialed.
    pub to: PeerId,
}

/// The acceptor's answer to a [`StreamHello`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Negotiation {
    Accepted,
    /// No binding is registered for the protocol.
    Unsupported,
    /// The listener belongs to a different peer than the one dialed.
    WrongPeer,
}
