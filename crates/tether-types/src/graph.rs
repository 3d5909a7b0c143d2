//! Serialized value graphs, the form every value takes on the wire.
//!
//! Aggregates live in an arena (`nodes`) and are referenced by handle, so a
//! value that appears twice in one message, or contains itself, is encoded
//! once. Function values never appear here: they are replaced by a
//! [`Descriptor`] before a message leaves the endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializable stand-in for a function value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Descriptor {
    /// A callable registered on the sending endpoint under `id`; invoking it
    /// issues a new call back to the sender.
    Remote { id: String },
    /// A named operation from the capability table both endpoints share.
    /// `id` is unique within one message.
    Inline { id: u64, op: String },
}

impl Descriptor {
    /// A `Remote` descriptor for registry name `id`.
    pub fn remote(id: impl Into<String>) -> Self {
        Self::Remote { id: id.into() }
    }

    /// The registry name a `Remote` descriptor points at.
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Self::Remote { id } => Some(id),
            Self::Inline { .. } => None,
        }
    }
}

/// One position in a serialized graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Null,
    Bool(bool),
    /// Any JSON number; integers stay exact.
    Number(serde_json::Number),
    String(String),
    /// Handle of an aggregate in [`Graph::nodes`].
    Node(usize),
    /// A function stand-in, serialized without a `descriptor` tag.
    #[serde(untagged)]
    Descriptor(Descriptor),
}

/// An aggregate in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    List(Vec<Slot>),
    /// String-keyed entries, kept sorted.
    Map(BTreeMap<String, Slot>),
}

/// A complete serialized value: a root slot plus the aggregates it reaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// The value itself, or the handle of its top aggregate.
    pub root: Slot,
    /// Aggregates, addressed by index.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
}

impl Graph {
    /// A graph holding a single non-aggregate value.
    pub fn primitive(root: Slot) -> Self {
        Self {
            root,
            nodes: Vec::new(),
        }
    }

    /// A graph holding a single string.
    pub fn string(value: impl Into<String>) -> Self {
        Self::primitive(Slot::String(value.into()))
    }

    /// Look up an aggregate by handle.
    pub fn node(&self, handle: usize) -> Option<&Node> {
        self.nodes.get(handle)
    }

    /// Whether the root is an aggregate rather than a primitive or descriptor.
    pub fn is_aggregate(&self) -> bool {
        matches!(self.root, Slot::Node(_))
    }

    /// The root as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match &self.root {
            Slot::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::primitive(Slot::Null)
    }
}
