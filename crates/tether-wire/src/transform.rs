//! Transform engine: turns live [`Value`]s into serializable [`Graph`]s.
//!
//! Each aggregate is given an arena handle *before* its members are visited,
//! so shared substructure is encoded once and cycles terminate. Functions are
//! replaced by descriptors: capability functions by name, everything else by
//! exporting a transient handler on the sending endpoint's registry.

use crate::registry::HandlerRegistry;
use crate::value::{Function, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tether_types::{Descriptor, Graph, Node, Slot};

/// One transform pass. Caches are scoped to the pass and discarded with it.
pub struct Transformer<'a> {
    registry: &'a HandlerRegistry,
    nodes: Vec<Node>,
    aggregates: HashMap<usize, usize>,
    functions: HashMap<usize, Descriptor>,
    next_inline_id: u64,
    // Keeps visited aggregates alive so their addresses stay unique for the pass.
    visited: Vec<Value>,
}

impl<'a> Transformer<'a> {
    /// One transform pass. Closures found in the value are registered in `registry`.
    pub fn new(registry: &'a HandlerRegistry) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
            aggregates: HashMap::new(),
            functions: HashMap::new(),
            next_inline_id: 0,
            visited: Vec::new(),
        }
    }

    /// Transform `value` and everything it reaches.
    pub fn transform(mut self, value: &Value) -> Graph {
        let root = self.slot(value);
        Graph {
            root,
            nodes: self.nodes,
        }
    }

    fn slot(&mut self, value: &Value) -> Slot {
        match value {
            Value::Null => Slot::Null,
            Value::Bool(b) => Slot::Bool(*b),
            Value::Number(n) => Slot::Number(n.clone()),
            Value::String(s) => Slot::String(s.clone()),
            Value::Descriptor(descriptor) => Slot::Descriptor(descriptor.clone()),
            Value::Function(function) => Slot::Descriptor(self.describe(function)),
            Value::List(list) => {
                let key = Arc::as_ptr(list) as *const () as usize;
                if let Some(&handle) = self.aggregates.get(&key) {
                    return Slot::Node(handle);
                }
                let handle = self.reserve(key, Node::List(Vec::new()), value);
                let items = list.read().unwrap_or_else(|e| e.into_inner()).clone();
                let slots = items.iter().map(|item| self.slot(item)).collect();
                self.nodes[handle] = Node::List(slots);
                Slot::Node(handle)
            }
            Value::Map(map) => {
                let key = Arc::as_ptr(map) as *const () as usize;
                if let Some(&handle) = self.aggregates.get(&key) {
                    return Slot::Node(handle);
                }
                let handle = self.reserve(key, Node::Map(Default::default()), value);
                let entries = map.read().unwrap_or_else(|e| e.into_inner()).clone();
                let slots = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.slot(v)))
                    .collect();
                self.nodes[handle] = Node::Map(slots);
                Slot::Node(handle)
            }
        }
    }

    fn reserve(&mut self, key: usize, placeholder: Node, value: &Value) -> usize {
        let handle = self.nodes.len();
        self.nodes.push(placeholder);
        self.aggregates.insert(key, handle);
        self.visited.push(value.clone());
        handle
    }

    fn describe(&mut self, function: &Function) -> Descriptor {
        let key = function.identity();
        if let Some(existing) = self.functions.get(&key) {
            return existing.clone();
        }
        let descriptor = match function.op() {
            Some(op) => {
                let id = self.next_inline_id;
                self.next_inline_id += 1;
                Descriptor::Inline {
                    id,
                    op: op.to_string(),
                }
            }
            None => self.registry.register_transient(Arc::clone(function.handler())),
        };
        self.functions.insert(key, descriptor.clone());
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{handler_fn, Capabilities};
    use std::time::Duration;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new("temp_fn_", Duration::from_secs(30))
    }

    fn closure() -> Function {
        Function::from_fn(|_| async { Ok(Value::from("called")) })
    }

    #[test]
    fn test_primitives_pass_through() {
        let registry = registry();
        let graph = Transformer::new(&registry).transform(&Value::from("hi"));
        assert_eq!(graph, Graph::string("hi"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_nested_aggregates() {
        let registry = registry();
        let value = Value::from_json(serde_json::json!({"a": [1, 2], "b": null}));
        let graph = Transformer::new(&registry).transform(&value);
        assert_eq!(graph.root, Slot::Node(0));
        assert_eq!(graph.nodes.len(), 2);
        match &graph.nodes[0] {
            Node::Map(entries) => {
                assert_eq!(entries["a"], Slot::Node(1));
                assert_eq!(entries["b"], Slot::Null);
            }
            other => panic!("Expected map, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_substructure_encoded_once() {
        let registry = registry();
        let shared = Value::list([Value::from(1)]);
        let value = Value::list([shared.clone(), shared]);
        let graph = Transformer::new(&registry).transform(&value);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[0], Node::List(vec![Slot::Node(1), Slot::Node(1)]));
    }

    #[test]
    fn test_cycle_terminates() {
        let registry = registry();
        let value = Value::map([("name", Value::from("loop"))]);
        value.insert("self", value.clone());
        let graph = Transformer::new(&registry).transform(&value);
        assert_eq!(graph.nodes.len(), 1);
        match &graph.nodes[0] {
            Node::Map(entries) => assert_eq!(entries["self"], Slot::Node(0)),
            other => panic!("Expected map, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closure_exported_as_transient() {
        let registry = registry();
        let f = closure();
        let value = Value::list([Value::from(f.clone()), Value::from(f)]);
        let graph = Transformer::new(&registry).transform(&value);

        let Node::List(slots) = &graph.nodes[0] else {
            panic!("Expected list");
        };
        let Slot::Descriptor(Descriptor::Remote { id }) = &slots[0] else {
            panic!("Expected remote descriptor, got {:?}", slots[0]);
        };
        assert_eq!(slots[0], slots[1]);
        assert!(registry.contains(id));
        assert_eq!(registry.transient_count(), 1);
    }

    #[test]
    fn test_capability_exported_inline() {
        let registry = registry();
        let mut caps = Capabilities::new();
        caps.insert("upper", handler_fn(|_| async { Ok(Value::Null) }));
        caps.insert("lower", handler_fn(|_| async { Ok(Value::Null) }));
        let value = Value::list([
            Value::from(caps.function("upper").unwrap()),
            Value::from(caps.function("lower").unwrap()),
        ]);
        let graph = Transformer::new(&registry).transform(&value);
        assert_eq!(
            graph.nodes[0],
            Node::List(vec![
                Slot::Descriptor(Descriptor::Inline {
                    id: 0,
                    op: "upper".to_string()
                }),
                Slot::Descriptor(Descriptor::Inline {
                    id: 1,
                    op: "lower".to_string()
                }),
            ])
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_descriptors_are_not_rewrapped() {
        let registry = registry();
        let descriptor = Descriptor::remote("temp_fn_abc");
        let value = Value::map([("cb", Value::from(descriptor.clone()))]);
        let first = Transformer::new(&registry).transform(&value);
        let Node::Map(entries) = &first.nodes[0] else {
            panic!("Expected map");
        };
        assert_eq!(entries["cb"], Slot::Descriptor(descriptor));
        assert!(registry.is_empty());
    }
}
