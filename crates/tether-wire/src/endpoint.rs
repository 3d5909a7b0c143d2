//! One side of a Tether channel.
//!
//! An [`Endpoint`] owns the handler registry, the pending-call table and the
//! capability table for its channel, plus three background tasks: a reader
//! that drains the transport into [`Endpoint::dispatch`], a writer that owns
//! the outbound half, and a sweeper that evicts stale transient handlers.
//! Every inbound request runs in its own task, so handlers may overlap. Those
//! tasks hold only a weak handle and are aborted when the endpoint is torn
//! down or dropped.

use crate::correlator::Correlator;
use crate::message::{Frame, Request, Response, WireMessage};
use crate::mirror::{Mirrored, RemoteFn};
use crate::registry::HandlerRegistry;
use crate::transform::Transformer;
use crate::transport::{FrameSink, FrameSource, Transport, WireError};
use crate::value::{Call, Capabilities, Handler, Value};
use bytes::Bytes;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tether_types::error::NOT_FOUND_PAYLOAD;
use tether_types::{CallError, CallResult, Descriptor, EndpointConfig, Fault, Graph};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the endpoint's default timeout.
    pub timeout: Option<Duration>,
    /// Buffers moved alongside the request instead of being encoded.
    pub transfer: Vec<Bytes>,
}

impl CallOptions {
    /// Options with only a timeout, in milliseconds.
    pub fn timeout_ms(ms: u64) -> Self {
        Self {
            timeout: Some(Duration::from_millis(ms)),
            ..Self::default()
        }
    }

    /// Set the timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach buffers to move with the request. They reach the handler as
    /// [`Call::transfer`].
    pub fn with_transfer(mut self, transfer: Vec<Bytes>) -> Self {
        self.transfer = transfer;
        self
    }
}

struct Inner {
    config: EndpointConfig,
    registry: HandlerRegistry,
    correlator: Correlator,
    capabilities: Capabilities,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // In-flight inbound requests; dropping the set aborts them.
    requests: Mutex<JoinSet<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Handle to one side of a channel. Cheap to clone; the background tasks stop
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

/// Non-owning handle held by mirrors and calls so they never keep an endpoint alive.
#[derive(Clone)]
pub struct WeakEndpoint(Weak<Inner>);

impl WeakEndpoint {
    /// The endpoint, if any strong handle is still alive.
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.0.upgrade().map(|inner| Endpoint { inner })
    }

    /// A handle bound to no endpoint; every upgrade fails.
    pub fn detached() -> Self {
        Self(Weak::new())
    }
}

impl fmt::Debug for WeakEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.0.strong_count() > 0;
        f.debug_struct("WeakEndpoint").field("live", &live).finish()
    }
}

/// Builder for an [`Endpoint`].
#[derive(Default)]
pub struct EndpointBuilder {
    config: EndpointConfig,
    capabilities: Capabilities,
    handlers: Vec<(String, Arc<dyn Handler>)>,
}

impl EndpointBuilder {
    /// Replace the default settings.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an operation to the capability table. Both sides of a channel
    /// should agree on the table for inline functions to resolve.
    pub fn capability(mut self, op: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.capabilities.insert(op, handler);
        self
    }

    /// Register a permanent handler before any traffic can arrive.
    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    /// Start the endpoint's tasks on `transport`. Must be called within a Tokio runtime.
    pub fn spawn(self, transport: impl Transport) -> Endpoint {
        let (sink, source) = transport.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let registry = HandlerRegistry::from_config(&self.config);
        for (name, handler) in self.handlers {
            registry.register(name, handler);
        }

        let sweep_interval = self.config.sweep_interval();
        let inner = Arc::new(Inner {
            config: self.config,
            registry,
            correlator: Correlator::new(),
            capabilities: self.capabilities,
            outbound,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            requests: Mutex::new(JoinSet::new()),
        });

        let weak = Arc::downgrade(&inner);
        let tasks = vec![
            tokio::spawn(write_loop(weak.clone(), sink, outbound_rx)),
            tokio::spawn(read_loop(weak.clone(), source)),
            tokio::spawn(sweep_loop(weak, sweep_interval)),
        ];
        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);

        debug!(
            capabilities = inner.capabilities.len(),
            handlers = inner.registry.len(),
            "Endpoint started"
        );
        Endpoint { inner }
    }
}

impl Endpoint {
    /// Start configuring an endpoint.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }

    /// Start an endpoint with default configuration and no capabilities.
    pub fn spawn(transport: impl Transport) -> Self {
        Self::builder().spawn(transport)
    }

    /// A handle that does not keep this endpoint alive.
    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint(Arc::downgrade(&self.inner))
    }

    /// Settings this endpoint was started with.
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Handlers the peer may call, permanent and transient.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Operations inline function descriptors resolve against.
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Register a permanent handler. An existing handler with this name is replaced.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.inner.registry.register(name, handler);
    }

    /// Register a transient handler under a generated name.
    pub fn register_transient(&self, handler: Arc<dyn Handler>) -> Descriptor {
        self.inner.registry.register_transient(handler)
    }

    /// Register a permanent handler and return a descriptor the peer can call.
    pub fn expose(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Descriptor {
        let name = name.into();
        self.inner.registry.register(name.clone(), handler);
        Descriptor::remote(name)
    }

    /// Remove handler `name`. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.registry.unregister(name)
    }

    /// A callable handle for the peer's handler `name`.
    pub fn method(&self, name: impl Into<String>) -> RemoteFn {
        RemoteFn::new(name, self.downgrade())
    }

    /// Number of outbound calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Whether the endpoint has been torn down. A closed endpoint never reopens.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Tear the endpoint down: pending calls fail with a connection error and
    /// the peer observes the channel closing.
    pub fn close(&self) {
        if !self.is_closed() {
            info!("Closing endpoint");
        }
        self.teardown();
    }

    /// Invoke handler `name` on the peer and wait for its result.
    pub async fn call(
        &self,
        name: &str,
        args: impl Into<Value>,
        options: CallOptions,
    ) -> CallResult<Mirrored> {
        if self.is_closed() {
            return Err(CallError::Connection);
        }
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.default_timeout());

        let mut pending = self.inner.correlator.register(name);
        // A teardown that ran before the entry existed could not reject it.
        if self.is_closed() {
            return Err(CallError::Connection);
        }

        let args = Transformer::new(&self.inner.registry).transform(&args.into());
        let request = WireMessage::Request(Request {
            id: pending.id.clone(),
            name: name.to_string(),
            args,
        });
        debug!(call_id = %pending.id, name = %name, "Sending request");
        if let Err(e) = self.post(&request, options.transfer) {
            warn!(call_id = %pending.id, name = %name, error = %e, "Failed to send request");
            return Err(match e {
                WireError::Json(e) => CallError::Internal(e.to_string()),
                _ => CallError::Connection,
            });
        }

        match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Connection),
            Err(_) => {
                debug!(call_id = %pending.id, name = %name, ?timeout, "Request timed out");
                Err(CallError::Timeout(timeout))
            }
        }
    }

    /// Route one inbound frame. Frames that are not protocol messages are ignored.
    ///
    /// Requests are handled on their own task, so this must be called within a
    /// Tokio runtime.
    pub fn dispatch(&self, frame: Frame) {
        let Frame { body, transfer } = frame;
        let message = match WireMessage::decode(body) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Ignoring non-protocol frame");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Ignoring malformed message");
                return;
            }
        };

        match message {
            WireMessage::Request(request) => {
                debug!(call_id = %request.id, name = %request.name, "Inbound request");
                let mut requests = self
                    .inner
                    .requests
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                while requests.try_join_next().is_some() {}
                requests.spawn(handle_request(self.downgrade(), request, transfer));
            }
            WireMessage::Response(response) => self.deliver(response),
        }
    }

    /// Post a response to an inbound request.
    fn respond(&self, response: Response) {
        let call_id = response.id.clone();
        if let Err(e) = self.post(&WireMessage::Response(response), Vec::new()) {
            if self.is_closed() {
                debug!(call_id = %call_id, error = %e, "Dropping response, endpoint closed");
            } else {
                self.fail_all(e);
            }
        }
    }

    fn deliver(&self, response: Response) {
        let Some(entry) = self.inner.correlator.take(&response.id) else {
            debug!(call_id = %response.id, "Dropping response for unknown call");
            return;
        };
        debug!(
            call_id = %response.id,
            name = %entry.name,
            is_reject = response.is_reject,
            "Response received"
        );
        let data = Mirrored::from_graph(response.data, self.downgrade());
        let outcome = if response.is_reject {
            Err(rejection(&entry.name, &data))
        } else {
            Ok(data)
        };
        entry.settle(outcome);
    }

    fn post(&self, message: &WireMessage, transfer: Vec<Bytes>) -> Result<(), WireError> {
        let frame = Frame {
            body: message.to_json()?,
            transfer,
        };
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| WireError::ConnectionClosed)
    }

    fn fail_all(&self, e: WireError) {
        let rejected = self
            .inner
            .correlator
            .reject_all(CallError::Internal(e.to_string()));
        error!(error = %e, rejected, "Failed to post response, rejected pending calls");
    }

    fn teardown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.registry.clear();
        let rejected = self.inner.correlator.reject_all(CallError::Connection);
        self.inner
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        warn!(rejected, "Endpoint torn down");
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("handlers", &self.inner.registry.len())
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Run one inbound request to completion and post its response.
///
/// Holds only a weak handle while the handler runs, so a handler that never
/// finishes cannot keep the endpoint alive.
async fn handle_request(endpoint: WeakEndpoint, request: Request, transfer: Vec<Bytes>) {
    let Request { id, name, args } = request;

    let handler = match endpoint.upgrade() {
        Some(live) => live.inner.registry.lookup(&name),
        None => return,
    };
    let outcome = match handler {
        None => {
            debug!(call_id = %id, name = %name, "Function not found");
            None
        }
        Some(handler) => {
            let call = Call {
                name: name.clone(),
                args: Mirrored::from_graph(args, endpoint.clone()),
                transfer,
                endpoint: endpoint.clone(),
            };
            let outcome = AssertUnwindSafe(handler.call(call))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(call_id = %id, name = %name, "Handler panicked");
                    Err(Fault::new("panic", format!("handler '{name}' panicked")))
                });
            Some(outcome)
        }
    };

    let Some(live) = endpoint.upgrade() else {
        debug!(call_id = %id, name = %name, "Endpoint dropped before response");
        return;
    };
    let transformer = Transformer::new(&live.inner.registry);
    let (is_reject, data) = match outcome {
        None => (true, Graph::string(NOT_FOUND_PAYLOAD)),
        Some(Ok(value)) => (false, transformer.transform(&value)),
        Some(Err(fault)) => {
            debug!(call_id = %id, name = %name, fault = %fault, "Handler failed");
            (true, transformer.transform(&fault_value(&fault)))
        }
    };
    live.respond(Response { id, is_reject, data });
}

/// Wire form of a handler fault: a map with `kind`, `message` and optional `details`.
fn fault_value(fault: &Fault) -> Value {
    let value = Value::map([
        ("kind", Value::from(fault.kind.as_str())),
        ("message", Value::from(fault.message.as_str())),
    ]);
    if !fault.details.is_null() {
        value.insert("details", Value::from_json(fault.details.clone()));
    }
    value
}

/// Map a rejected response's payload to the caller's error.
fn rejection(name: &str, data: &Mirrored) -> CallError {
    if data.as_str() == Some(NOT_FOUND_PAYLOAD) {
        return CallError::NotFound(name.to_string());
    }
    let json = data.to_json().unwrap_or(serde_json::Value::Null);
    if let Ok(fault) = serde_json::from_value::<Fault>(json.clone()) {
        return CallError::Handler(fault);
    }
    let message = match &json {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    CallError::Handler(Fault::new("rejected", message).with_details(json))
}

async fn write_loop(
    weak: Weak<Inner>,
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "Transport write failed");
            if let Some(inner) = weak.upgrade() {
                Endpoint { inner }.teardown();
            }
            return;
        }
    }
}

async fn read_loop(weak: Weak<Inner>, mut source: Box<dyn FrameSource>) {
    loop {
        let received = source.recv().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let endpoint = Endpoint { inner };
        match received {
            Ok(Some(frame)) => endpoint.dispatch(frame),
            Ok(None) => {
                info!("Transport closed by peer");
                endpoint.teardown();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Transport read failed");
                endpoint.teardown();
                return;
            }
        }
    }
}

async fn sweep_loop(weak: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.registry.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::value::handler_fn;
    use serde_json::json;

    fn pair() -> (Endpoint, Endpoint) {
        let (a, b) = MemoryTransport::pair();
        (Endpoint::spawn(a), Endpoint::spawn(b))
    }

    fn sum() -> Arc<dyn Handler> {
        handler_fn(|call: Call| async move {
            let a = call.f64_arg(0)?;
            let b = call.f64_arg(1)?;
            Ok(Value::from(a + b))
        })
    }

    #[tokio::test]
    async fn test_call_resolves_with_result() {
        let (client, server) = pair();
        server.register("sum", sum());

        let result = client
            .call("sum", vec![2, 3], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.as_f64(), Some(5.0));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_handler_is_not_found() {
        let (client, _server) = pair();
        let err = client
            .call("missing", Value::Null, CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, CallError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_fault_reaches_caller() {
        let (client, server) = pair();
        server.register(
            "boom",
            handler_fn(|_| async {
                Err(Fault::new("boom", "bad").with_details(json!({"code": 7})))
            }),
        );

        let err = client
            .call("boom", Value::Null, CallOptions::default())
            .await
            .unwrap_err();
        let fault = err.fault().unwrap();
        assert_eq!(fault.kind, "boom");
        assert_eq!(fault.message, "bad");
        assert_eq!(fault.details, json!({"code": 7}));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_fault() {
        let (client, server) = pair();
        server.register(
            "explode",
            handler_fn(|_| async {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }),
        );

        let err = client
            .call("explode", Value::Null, CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.fault().map(|f| f.kind.as_str()), Some("panic"));

        // The server keeps serving after a handler panic.
        server.register("sum", sum());
        let ok = client.call("sum", vec![1, 1], CallOptions::default()).await;
        assert_eq!(ok.unwrap().as_f64(), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_entry() {
        let (client, server) = pair();
        server.register(
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            }),
        );

        let start = Instant::now();
        let err = client
            .call("slow", Value::Null, CallOptions::timeout_ms(50))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Timeout(Duration::from_millis(50)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(100));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let (client, _server) = pair();
        let stray = WireMessage::Response(Response {
            id: "nobody".to_string(),
            is_reject: false,
            data: Graph::string("late"),
        });
        client.dispatch(Frame::new(stray.to_json().unwrap()));
        client.dispatch(Frame::new(json!({"hello": "world"})));
        client.dispatch(Frame::new(json!({"__tether__": true, "id": 1})));
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_close_rejects_and_propagates() {
        let (client, server) = pair();
        server.register(
            "never",
            handler_fn(|_| futures::future::pending::<Result<Value, Fault>>()),
        );

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call("never", Value::Null, CallOptions::default()).await })
        };
        while client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        client.close();
        assert!(client.is_closed());
        assert_eq!(pending.await.unwrap().unwrap_err(), CallError::Connection);
        assert_eq!(
            client.call("never", Value::Null, CallOptions::default()).await.unwrap_err(),
            CallError::Connection
        );

        while !server.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(server.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_stale_transients() {
        let (a, _b) = MemoryTransport::pair();
        let config = EndpointConfig {
            transient_ttl_secs: 1,
            sweep_interval_secs: 1,
            ..EndpointConfig::default()
        };
        let endpoint = Endpoint::builder()
            .config(config)
            .handler("keep", sum())
            .spawn(a);
        endpoint.register_transient(sum());
        assert_eq!(endpoint.registry().transient_count(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(endpoint.registry().transient_count(), 0);
        assert!(endpoint.registry().contains("keep"));
    }

    #[tokio::test]
    async fn test_expose_returns_callable_descriptor() {
        let (client, server) = pair();
        let descriptor = server.expose("named_cb", sum());
        assert_eq!(descriptor.remote_id(), Some("named_cb"));
        let result = client
            .method("named_cb")
            .call(vec![4, 5], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.as_f64(), Some(9.0));
    }

    #[tokio::test]
    async fn test_dropped_endpoint_aborts_hung_handler() {
        let (client, server) = pair();
        let (guard_tx, guard_rx) = tokio::sync::oneshot::channel::<()>();
        let guard = Arc::new(Mutex::new(Some(guard_tx)));
        let slot = guard.clone();
        server.register(
            "hang",
            handler_fn(move |_| {
                let held = slot.lock().unwrap().take();
                async move {
                    let _held = held;
                    futures::future::pending::<Result<Value, Fault>>().await
                }
            }),
        );

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call("hang", Value::Null, CallOptions::default()).await })
        };
        while guard.lock().unwrap().is_some() {
            tokio::task::yield_now().await;
        }

        drop(server);
        assert!(guard_rx.await.is_err());
        assert_eq!(pending.await.unwrap().unwrap_err(), CallError::Connection);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_close_aborts_running_handlers() {
        let (client, server) = pair();
        let (guard_tx, guard_rx) = tokio::sync::oneshot::channel::<()>();
        let guard = Arc::new(Mutex::new(Some(guard_tx)));
        let slot = guard.clone();
        server.register(
            "hang",
            handler_fn(move |_| {
                let held = slot.lock().unwrap().take();
                async move {
                    let _held = held;
                    futures::future::pending::<Result<Value, Fault>>().await
                }
            }),
        );

        let _pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call("hang", Value::Null, CallOptions::default()).await })
        };
        while guard.lock().unwrap().is_some() {
            tokio::task::yield_now().await;
        }

        server.close();
        assert!(guard_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_failed_response_post_rejects_pending_calls() {
        let (a, b) = MemoryTransport::pair();
        let endpoint = Endpoint::spawn(a);
        endpoint.register("gate", handler_fn(|_| async { Ok(Value::Null) }));
        let (mut peer_sink, mut source) = b.into_split();

        let pending = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.call("hang", Value::Null, CallOptions::default()).await })
        };
        let first = source.recv().await.unwrap().unwrap();
        assert!(WireMessage::decode(first.body).unwrap().is_some());

        let writer = endpoint.inner.tasks.lock().unwrap().remove(0);
        writer.abort();
        let _ = writer.await;

        let request = WireMessage::Request(Request {
            id: "peer-1".to_string(),
            name: "gate".to_string(),
            args: Graph::default(),
        });
        peer_sink
            .send(Frame::new(request.to_json().unwrap()))
            .await
            .unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Internal(_)), "got {err:?}");
        assert!(!endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_response_after_close_is_dropped_quietly() {
        let (endpoint, _peer) = pair();
        endpoint.close();
        while !endpoint.inner.outbound.is_closed() {
            tokio::task::yield_now().await;
        }

        let mut pending = endpoint.inner.correlator.register("late");
        endpoint.respond(Response {
            id: "peer-1".to_string(),
            is_reject: false,
            data: Graph::string("done"),
        });
        assert_eq!(
            pending.rx.try_recv().unwrap_err(),
            tokio::sync::oneshot::error::TryRecvError::Empty
        );
    }

    #[tokio::test]
    async fn test_deep_reject_payload_maps_to_rejected_fault() {
        use std::collections::BTreeMap;
        use tether_types::graph::{Node, Slot};

        let (a, b) = MemoryTransport::pair();
        let client = Endpoint::spawn(a);
        let (mut sink, mut source) = b.into_split();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call("deep", Value::Null, CallOptions::default()).await })
        };
        let frame = source.recv().await.unwrap().unwrap();
        let id = WireMessage::decode(frame.body).unwrap().unwrap().id().to_string();

        let depth = 200_000;
        let mut nodes: Vec<Node> = (1..depth)
            .map(|next| Node::Map(BTreeMap::from([("next".to_string(), Slot::Node(next))])))
            .collect();
        nodes.push(Node::Map(BTreeMap::new()));
        let reply = WireMessage::Response(Response {
            id,
            is_reject: true,
            data: Graph {
                root: Slot::Node(0),
                nodes,
            },
        });
        sink.send(Frame::new(reply.to_json().unwrap())).await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.fault().map(|f| f.kind.as_str()), Some("rejected"));
        assert!(!client.is_closed());
    }

    #[test]
    fn test_rejection_mapping() {
        let detached = |graph: Graph| Mirrored::from_graph(graph, WeakEndpoint::detached());

        assert_eq!(
            rejection("f", &detached(Graph::string(NOT_FOUND_PAYLOAD))),
            CallError::NotFound("f".to_string())
        );

        let other = rejection("f", &detached(Graph::string("nope")));
        let fault = other.fault().unwrap();
        assert_eq!(fault.kind, "rejected");
        assert_eq!(fault.message, "nope");
        assert_eq!(fault.details, json!("nope"));
    }

    #[test]
    fn test_fault_value_shape() {
        let value = fault_value(&Fault::new("boom", "bad"));
        assert_eq!(value.to_json(), Some(json!({"kind": "boom", "message": "bad"})));
    }
}
