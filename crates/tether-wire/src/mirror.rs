//! Reconstruction engine: typed read-through views over inbound graphs.
//!
//! A [`Mirror`] never copies the graph it views. Each accessor resolves one
//! slot on demand: primitives come back as-is, nested aggregates as further
//! mirrors, and descriptors as callables. `Remote` descriptors become
//! [`RemoteFn`]s that call back into the peer; `Inline` descriptors resolve
//! against the local capability table, memoized per message by id.

use crate::endpoint::{CallOptions, WeakEndpoint};
use crate::transform::Transformer;
use crate::value::{Call, Function, Value};
use serde_json::Number;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tether_types::{CallError, CallResult, Descriptor, Graph, Node, Slot};

/// State shared by every mirror cut from one inbound message.
struct MirrorContext {
    graph: Graph,
    endpoint: WeakEndpoint,
    inline: Mutex<HashMap<u64, Function>>,
}

/// A view over one aggregate in an inbound graph.
#[derive(Clone)]
pub struct Mirror {
    ctx: Arc<MirrorContext>,
    handle: usize,
}

/// A resolved position in an inbound graph.
#[derive(Clone)]
pub enum Mirrored {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Mirror),
    Map(Mirror),
    /// A callable living on the peer.
    Remote(RemoteFn),
    /// A capability resolved in the local table.
    Local(LocalFn),
    /// An inline descriptor naming an operation this side does not have.
    Unresolved(Descriptor),
}

impl Mirrored {
    /// Wrap an inbound graph, bound to the endpoint that received it.
    pub fn from_graph(graph: Graph, endpoint: WeakEndpoint) -> Self {
        let root = graph.root.clone();
        let ctx = Arc::new(MirrorContext {
            graph,
            endpoint,
            inline: Mutex::new(HashMap::new()),
        });
        resolve(&ctx, &root)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The aggregate view, for lists and maps.
    pub fn as_mirror(&self) -> Option<&Mirror> {
        match self {
            Self::List(m) | Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// The handle for a function that lives on the peer.
    pub fn as_remote(&self) -> Option<&RemoteFn> {
        match self {
            Self::Remote(f) => Some(f),
            _ => None,
        }
    }

    /// The handle for a capability resolved on this side.
    pub fn as_local(&self) -> Option<&LocalFn> {
        match self {
            Self::Local(f) => Some(f),
            _ => None,
        }
    }

    /// Materialize as plain JSON. `None` if a callable or cycle is reachable,
    /// or aggregates nest more than 128 deep.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Number(n) => Some(serde_json::Value::Number(n.clone())),
            Self::String(s) => Some(serde_json::Value::String(s.clone())),
            Self::List(m) | Self::Map(m) => m.to_json(),
            Self::Remote(_) | Self::Local(_) | Self::Unresolved(_) => None,
        }
    }
}

impl fmt::Debug for Mirrored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::List(m) => write!(f, "List(len={})", m.len()),
            Self::Map(m) => write!(f, "Map(keys={:?})", m.keys()),
            Self::Remote(r) => write!(f, "Remote({})", r.id),
            Self::Local(l) => write!(f, "Local({})", l.op),
            Self::Unresolved(d) => write!(f, "Unresolved({d:?})"),
        }
    }
}

impl Mirror {
    fn node(&self) -> &Node {
        // Handles come from the graph's own slots; `resolve` rejects dangling ones.
        &self.ctx.graph.nodes[self.handle]
    }

    pub fn is_list(&self) -> bool {
        matches!(self.node(), Node::List(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self.node(), Node::Map(_))
    }

    /// Number of list elements or map entries.
    pub fn len(&self) -> usize {
        match self.node() {
            Node::List(items) => items.len(),
            Node::Map(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` of a list.
    pub fn at(&self, index: usize) -> Option<Mirrored> {
        match self.node() {
            Node::List(items) => items.get(index).map(|slot| resolve(&self.ctx, slot)),
            Node::Map(_) => None,
        }
    }

    /// Entry `key` of a map.
    pub fn get(&self, key: &str) -> Option<Mirrored> {
        match self.node() {
            Node::Map(entries) => entries.get(key).map(|slot| resolve(&self.ctx, slot)),
            Node::List(_) => None,
        }
    }

    /// Map keys in order; empty for lists.
    pub fn keys(&self) -> Vec<String> {
        match self.node() {
            Node::Map(entries) => entries.keys().cloned().collect(),
            Node::List(_) => Vec::new(),
        }
    }

    /// Resolve every element (lists) or value (maps).
    pub fn values(&self) -> Vec<Mirrored> {
        match self.node() {
            Node::List(items) => items.iter().map(|s| resolve(&self.ctx, s)).collect(),
            Node::Map(entries) => entries.values().map(|s| resolve(&self.ctx, s)).collect(),
        }
    }

    /// Materialize as plain JSON. `None` if a callable or cycle is reachable,
    /// or aggregates nest more than 128 deep.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        let mut path = Vec::new();
        node_to_json(&self.ctx.graph, self.handle, &mut path)
    }
}

fn resolve(ctx: &Arc<MirrorContext>, slot: &Slot) -> Mirrored {
    match slot {
        Slot::Null => Mirrored::Null,
        Slot::Bool(b) => Mirrored::Bool(*b),
        Slot::Number(n) => Mirrored::Number(n.clone()),
        Slot::String(s) => Mirrored::String(s.clone()),
        Slot::Node(handle) => {
            let mirror = Mirror {
                ctx: Arc::clone(ctx),
                handle: *handle,
            };
            match ctx.graph.node(*handle) {
                Some(Node::List(_)) => Mirrored::List(mirror),
                Some(Node::Map(_)) => Mirrored::Map(mirror),
                None => Mirrored::Null,
            }
        }
        Slot::Descriptor(Descriptor::Remote { id }) => Mirrored::Remote(RemoteFn {
            id: id.clone(),
            endpoint: ctx.endpoint.clone(),
        }),
        Slot::Descriptor(descriptor @ Descriptor::Inline { id, op }) => {
            let mut cache = ctx.inline.lock().unwrap_or_else(|e| e.into_inner());
            let function = match cache.get(id) {
                Some(function) => Some(function.clone()),
                None => {
                    let found = ctx
                        .endpoint
                        .upgrade()
                        .and_then(|endpoint| endpoint.capabilities().function(op));
                    if let Some(function) = &found {
                        cache.insert(*id, function.clone());
                    }
                    found
                }
            };
            match function {
                Some(function) => Mirrored::Local(LocalFn {
                    op: op.clone(),
                    function,
                    endpoint: ctx.endpoint.clone(),
                }),
                None => Mirrored::Unresolved(descriptor.clone()),
            }
        }
    }
}

/// Deepest aggregate nesting `to_json` will materialize (serde_json's parse limit).
const MAX_JSON_DEPTH: usize = 128;

fn slot_to_json(graph: &Graph, slot: &Slot, path: &mut Vec<usize>) -> Option<serde_json::Value> {
    match slot {
        Slot::Null => Some(serde_json::Value::Null),
        Slot::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Slot::Number(n) => Some(serde_json::Value::Number(n.clone())),
        Slot::String(s) => Some(serde_json::Value::String(s.clone())),
        Slot::Node(handle) => node_to_json(graph, *handle, path),
        Slot::Descriptor(_) => None,
    }
}

fn node_to_json(graph: &Graph, handle: usize, path: &mut Vec<usize>) -> Option<serde_json::Value> {
    if path.len() >= MAX_JSON_DEPTH || path.contains(&handle) {
        return None;
    }
    path.push(handle);
    let out = match graph.node(handle)? {
        Node::List(items) => items
            .iter()
            .map(|slot| slot_to_json(graph, slot, path))
            .collect::<Option<Vec<_>>>()
            .map(serde_json::Value::Array),
        Node::Map(entries) => entries
            .iter()
            .map(|(k, slot)| slot_to_json(graph, slot, path).map(|v| (k.clone(), v)))
            .collect::<Option<serde_json::Map<_, _>>>()
            .map(serde_json::Value::Object),
    };
    path.pop();
    out
}

/// A callable registered on the peer, reached through a new correlated call.
#[derive(Clone)]
pub struct RemoteFn {
    id: String,
    endpoint: WeakEndpoint,
}

impl RemoteFn {
    pub(crate) fn new(id: impl Into<String>, endpoint: WeakEndpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
        }
    }

    /// Name of the peer's handler.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Invoke the peer's handler.
    pub async fn call(&self, args: impl Into<Value>, options: CallOptions) -> CallResult<Mirrored> {
        let endpoint = self.endpoint.upgrade().ok_or(CallError::Connection)?;
        endpoint.call(&self.id, args, options).await
    }
}

/// A capability function resolved on this side of the channel.
#[derive(Clone)]
pub struct LocalFn {
    op: String,
    function: Function,
    endpoint: WeakEndpoint,
}

impl LocalFn {
    pub fn op(&self) -> &str {
        &self.op
    }

    /// The local capability this descriptor resolved to.
    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Run the capability locally with the same argument shape a remote caller sees.
    pub async fn call(&self, args: impl Into<Value>) -> CallResult<Mirrored> {
        let endpoint = self.endpoint.upgrade().ok_or(CallError::Connection)?;
        let graph = Transformer::new(endpoint.registry()).transform(&args.into());
        let call = Call {
            name: self.op.clone(),
            args: Mirrored::from_graph(graph, self.endpoint.clone()),
            transfer: Vec::new(),
            endpoint: self.endpoint.clone(),
        };
        let result = self.function.handler().call(call).await?;
        let graph = Transformer::new(endpoint.registry()).transform(&result);
        Ok(Mirrored::from_graph(graph, self.endpoint.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn detached(graph: Graph) -> Mirrored {
        Mirrored::from_graph(graph, WeakEndpoint::detached())
    }

    fn sample() -> Graph {
        Graph {
            root: Slot::Node(0),
            nodes: vec![
                Node::Map(BTreeMap::from([
                    ("n".to_string(), Slot::Number(5.into())),
                    ("items".to_string(), Slot::Node(1)),
                    (
                        "cb".to_string(),
                        Slot::Descriptor(Descriptor::remote("temp_fn_x")),
                    ),
                ])),
                Node::List(vec![Slot::String("a".into()), Slot::Bool(true)]),
            ],
        }
    }

    #[test]
    fn test_accessors() {
        let root = detached(sample());
        let map = root.as_mirror().unwrap();
        assert!(map.is_map());
        assert_eq!(map.keys(), vec!["cb", "items", "n"]);
        assert_eq!(map.get("n").unwrap().as_i64(), Some(5));

        let items = map.get("items").unwrap();
        let items = items.as_mirror().unwrap();
        assert!(items.is_list());
        assert_eq!(items.len(), 2);
        assert_eq!(items.at(0).unwrap().as_str(), Some("a"));
        assert_eq!(items.at(1).unwrap().as_bool(), Some(true));
        assert!(items.at(2).is_none());
        assert!(items.get("n").is_none());
    }

    #[test]
    fn test_remote_descriptor_becomes_callable() {
        let root = detached(sample());
        let cb = root.as_mirror().unwrap().get("cb").unwrap();
        assert_eq!(cb.as_remote().unwrap().id(), "temp_fn_x");
    }

    #[tokio::test]
    async fn test_remote_call_without_endpoint_is_connection_error() {
        let root = detached(sample());
        let cb = root.as_mirror().unwrap().get("cb").unwrap();
        let err = cb
            .as_remote()
            .unwrap()
            .call(Value::list([]), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Connection);
    }

    #[test]
    fn test_unknown_inline_is_unresolved() {
        let graph = Graph::primitive(Slot::Descriptor(Descriptor::Inline {
            id: 0,
            op: "upper".into(),
        }));
        assert!(matches!(detached(graph), Mirrored::Unresolved(_)));
    }

    #[test]
    fn test_to_json_plain_and_with_callables() {
        let plain = Graph {
            root: Slot::Node(0),
            nodes: vec![Node::List(vec![Slot::Number(1.into()), Slot::Null])],
        };
        assert_eq!(detached(plain).to_json(), Some(json!([1, null])));
        assert_eq!(detached(sample()).to_json(), None);
    }

    #[test]
    fn test_to_json_cycle_is_none() {
        let graph = Graph {
            root: Slot::Node(0),
            nodes: vec![Node::List(vec![Slot::Node(0)])],
        };
        let root = detached(graph);
        assert_eq!(root.to_json(), None);
        // Still navigable lazily.
        let inner = root.as_mirror().unwrap().at(0).unwrap();
        assert_eq!(inner.as_mirror().unwrap().len(), 1);
    }

    fn chain(depth: usize) -> Graph {
        let mut nodes: Vec<Node> = (1..depth)
            .map(|next| Node::Map(BTreeMap::from([("next".to_string(), Slot::Node(next))])))
            .collect();
        nodes.push(Node::Map(BTreeMap::new()));
        Graph {
            root: Slot::Node(0),
            nodes,
        }
    }

    #[test]
    fn test_to_json_depth_limit() {
        assert!(detached(chain(MAX_JSON_DEPTH)).to_json().is_some());
        assert_eq!(detached(chain(MAX_JSON_DEPTH + 1)).to_json(), None);

        let deep = detached(chain(200_000));
        assert_eq!(deep.to_json(), None);
        let second = deep.as_mirror().unwrap().get("next").unwrap();
        assert!(second.as_mirror().unwrap().is_map());
    }

    #[test]
    fn test_dangling_handle_reads_as_null() {
        let graph = Graph {
            root: Slot::Node(0),
            nodes: vec![Node::List(vec![Slot::Node(7)])],
        };
        let root = detached(graph);
        assert!(root.as_mirror().unwrap().at(0).unwrap().is_null());
    }
}
