//! Wire protocol message types.
//!
//! Every protocol message is a JSON object carrying the `__tether__` marker;
//! anything else arriving on the channel is foreign traffic and is ignored.
//! On stream transports each frame is prefixed with a 4-byte big-endian
//! length header, followed by any buffers marked for transfer.

use bytes::Bytes;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use tether_types::Graph;

/// Field that marks a JSON object as a protocol message.
pub const PROTOCOL_MARKER: &str = "__tether__";

/// A unit of transport traffic: a JSON body plus buffers to move, not copy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub body: serde_json::Value,
    pub transfer: Vec<Bytes>,
}

impl Frame {
    /// A frame with no transfer buffers.
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            transfer: Vec::new(),
        }
    }
}

/// Invoke handler `name` on the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub name: String,
    pub args: Graph,
}

/// Outcome of a request, matched to the caller by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub is_reject: bool,
    pub data: Graph,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Request(Request),
    Response(Response),
}

/// Flat on-the-wire shape shared by both message kinds.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "__tether__")]
    marker: bool,
    is_request: bool,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Graph>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_reject: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Graph>,
}

impl WireMessage {
    /// Correlation id, shared by a request and its response.
    pub fn id(&self) -> &str {
        match self {
            Self::Request(r) => &r.id,
            Self::Response(r) => &r.id,
        }
    }

    /// Encode as a JSON body.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let envelope = match self {
            Self::Request(r) => Envelope {
                marker: true,
                is_request: true,
                id: r.id.clone(),
                name: Some(r.name.clone()),
                args: Some(r.args.clone()),
                is_reject: false,
                data: None,
            },
            Self::Response(r) => Envelope {
                marker: true,
                is_request: false,
                id: r.id.clone(),
                name: None,
                args: None,
                is_reject: r.is_reject,
                data: Some(r.data.clone()),
            },
        };
        serde_json::to_value(envelope)
    }

    /// Decode a JSON body.
    ///
    /// `Ok(None)` means the body is not protocol traffic. A body that carries
    /// the marker but not a valid message is an error.
    pub fn decode(body: serde_json::Value) -> Result<Option<Self>, serde_json::Error> {
        if body.get(PROTOCOL_MARKER) != Some(&serde_json::Value::Bool(true)) {
            return Ok(None);
        }
        let envelope: Envelope = serde_json::from_value(body)?;
        let message = if envelope.is_request {
            Self::Request(Request {
                id: envelope.id,
                name: envelope
                    .name
                    .ok_or_else(|| serde_json::Error::missing_field("name"))?,
                args: envelope.args.unwrap_or_default(),
            })
        } else {
            Self::Response(Response {
                id: envelope.id,
                is_reject: envelope.is_reject,
                data: envelope.data.unwrap_or_default(),
            })
        };
        Ok(Some(message))
    }
}

/// Encode a frame for a byte stream:
/// `len(u32 BE) | JSON | count(u32 BE) | (len(u32 BE) | bytes)*`.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(&frame.body)?;
    let extra: usize = frame.transfer.iter().map(|b| 4 + b.len()).sum();
    let mut bytes = Vec::with_capacity(8 + json.len() + extra);
    bytes.extend_from_slice(&(json.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&json);
    bytes.extend_from_slice(&(frame.transfer.len() as u32).to_be_bytes());
    for buffer in &frame.transfer {
        bytes.extend_from_slice(&(buffer.len() as u32).to_be_bytes());
        bytes.extend_from_slice(buffer);
    }
    Ok(bytes)
}

/// Decode a length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}
