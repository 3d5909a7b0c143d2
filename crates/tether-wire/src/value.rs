//! Live values and callables.
//!
//! A [`Value`] is what application code hands to an endpoint: plain data
//! plus [`Function`]s. Aggregates are shared (`Arc`) so the same list or map
//! can appear in several places, including inside itself; the transform
//! engine preserves that sharing on the wire.

use crate::endpoint::WeakEndpoint;
use crate::mirror::Mirrored;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Number;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tether_types::{Descriptor, Fault};

/// Shared, mutable aggregate storage.
pub type Shared<T> = Arc<RwLock<T>>;

/// One inbound invocation of a handler.
pub struct Call {
    /// Name the caller used (registry key or capability op).
    pub name: String,
    /// Reconstructed arguments; remote references inside are callable.
    pub args: Mirrored,
    /// Buffers the caller marked for zero-copy transfer.
    pub transfer: Vec<Bytes>,
    /// The endpoint the call arrived on.
    pub endpoint: WeakEndpoint,
}

impl Call {
    /// Positional argument `index`, when the arguments are a list.
    pub fn arg(&self, index: usize) -> Option<Mirrored> {
        self.args.as_mirror().and_then(|args| args.at(index))
    }

    /// Positional argument `index` as a number.
    pub fn f64_arg(&self, index: usize) -> Result<f64, Fault> {
        self.arg(index)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Fault::invalid_args(format!("argument {index} must be a number")))
    }
}

/// A callable registered on an endpoint.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Run one invocation. An `Err` reaches the caller as a rejection.
    async fn call(&self, call: Call) -> Result<Value, Fault>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    async fn call(&self, call: Call) -> Result<Value, Fault> {
        (self.0)(call).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A function value.
///
/// Capability-backed functions (`op` set) cross the boundary by name and are
/// resolved against the peer's own [`Capabilities`]. Every other function is
/// exported as a transient handler on the sending endpoint.
#[derive(Clone)]
pub struct Function {
    handler: Arc<dyn Handler>,
    op: Option<String>,
}

impl Function {
    /// A function exported by reference when sent.
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler, op: None }
    }

    /// Shorthand for `Function::new(handler_fn(f))`.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        Self::new(handler_fn(f))
    }

    /// A function sent by name. The receiver runs its own handler for `op`.
    pub fn capability(op: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            op: Some(op.into()),
        }
    }

    /// The capability op, or `None` for a plain closure.
    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Address of the underlying handler; equal for clones of one function.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.handler) as *const () as usize
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Some(op) => write!(f, "Function(op={op})"),
            None => write!(f, "Function(<closure>)"),
        }
    }
}

/// Closed table of named operations both endpoints agree on.
#[derive(Clone, Default)]
pub struct Capabilities {
    ops: HashMap<String, Arc<dyn Handler>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `op`, replacing any handler already under that name.
    pub fn insert(&mut self, op: impl Into<String>, handler: Arc<dyn Handler>) {
        self.ops.insert(op.into(), handler);
    }

    /// A function value for `op`, ready to embed in outgoing data.
    pub fn function(&self, op: &str) -> Option<Function> {
        self.ops
            .get(op)
            .map(|handler| Function::capability(op, Arc::clone(handler)))
    }

    /// Whether `op` is in the table.
    pub fn contains(&self, op: &str) -> bool {
        self.ops.contains_key(op)
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A live value on the sending side of a call.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Shared<Vec<Value>>),
    Map(Shared<BTreeMap<String, Value>>),
    Function(Function),
    /// A descriptor produced earlier; sent as-is, never re-wrapped.
    Descriptor(Descriptor),
}

impl Value {
    /// A new shared list.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    /// A new shared map.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(Arc::new(RwLock::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    /// Append to a list in place. Returns false if `self` is not a list.
    pub fn push(&self, item: Value) -> bool {
        match self {
            Self::List(list) => {
                list.write().unwrap_or_else(|e| e.into_inner()).push(item);
                true
            }
            _ => false,
        }
    }

    /// Insert into a map in place. Returns false if `self` is not a map.
    pub fn insert(&self, key: impl Into<String>, item: Value) -> bool {
        match self {
            Self::Map(map) => {
                map.write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.into(), item);
                true
            }
            _ => false,
        }
    }

    /// Convert plain JSON into fresh, unshared aggregates.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::list(items.into_iter().map(Self::from_json)),
            serde_json::Value::Object(entries) => {
                Self::map(entries.into_iter().map(|(k, v)| (k, Self::from_json(v))))
            }
        }
    }

    /// Plain-data view of this value.
    ///
    /// Returns `None` if the value contains a function, a descriptor, or a
    /// cycle, none of which have a JSON form.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        let mut path = Vec::new();
        self.to_json_inner(&mut path)
    }

    fn to_json_inner(&self, path: &mut Vec<usize>) -> Option<serde_json::Value> {
        match self {
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Number(n) => Some(serde_json::Value::Number(n.clone())),
            Self::String(s) => Some(serde_json::Value::String(s.clone())),
            Self::Function(_) | Self::Descriptor(_) => None,
            Self::List(list) => {
                let key = Arc::as_ptr(list) as *const () as usize;
                if path.contains(&key) {
                    return None;
                }
                path.push(key);
                let items = list.read().unwrap_or_else(|e| e.into_inner()).clone();
                let out = items
                    .iter()
                    .map(|item| item.to_json_inner(path))
                    .collect::<Option<Vec<_>>>();
                path.pop();
                out.map(serde_json::Value::Array)
            }
            Self::Map(map) => {
                let key = Arc::as_ptr(map) as *const () as usize;
                if path.contains(&key) {
                    return None;
                }
                path.push(key);
                let entries = map.read().unwrap_or_else(|e| e.into_inner()).clone();
                let out = entries
                    .iter()
                    .map(|(k, v)| v.to_json_inner(path).map(|v| (k.clone(), v)))
                    .collect::<Option<serde_json::Map<_, _>>>();
                path.pop();
                out.map(serde_json::Value::Object)
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Debug for Value {
    // Shallow on purpose: aggregates may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::List(list) => {
                let len = list.read().map(|l| l.len()).unwrap_or(0);
                write!(f, "List(len={len})")
            }
            Self::Map(map) => {
                let len = map.read().map(|m| m.len()).unwrap_or(0);
                write!(f, "Map(len={len})")
            }
            Self::Function(func) => func.fmt(f),
            Self::Descriptor(d) => write!(f, "Descriptor({d:?})"),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite numbers have no JSON form and become `Null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Self::Number).unwrap_or(Self::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Self::Function(f)
    }
}

impl From<Descriptor> for Value {
    fn from(d: Descriptor) -> Self {
        Self::Descriptor(d)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::list(items.into_iter().map(Into::into))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}
