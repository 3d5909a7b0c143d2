//! Tether wire engine: bidirectional RPC between two isolated contexts.
//!
//! Either side of a channel can call named handlers on the other, pass
//! functions as callbacks, and receive structured results or faults, with any
//! number of calls in flight over one transport.
//!
//! ## Architecture
//!
//! - **Transformer**: turns outgoing [`Value`]s into serializable graphs, exporting functions as descriptors
//! - **Mirror**: lazy typed view over an inbound graph; descriptors come back callable
//! - **Correlator**: pending-call table matching responses to callers by id
//! - **Endpoint**: dispatcher plus reader, writer and sweeper tasks for one channel
//! - **HandlerRegistry**: permanent and transient handlers, with TTL eviction
//! - **Transport**: in-process channel pair or length-framed byte stream

pub mod correlator;
pub mod endpoint;
pub mod message;
pub mod mirror;
pub mod registry;
pub mod transform;
pub mod transport;
pub mod value;

pub use endpoint::{CallOptions, Endpoint, EndpointBuilder, WeakEndpoint};
pub use message::{Frame, WireMessage, PROTOCOL_MARKER};
pub use mirror::{LocalFn, Mirror, Mirrored, RemoteFn};
pub use registry::{HandlerRegistry, Lifetime};
pub use transform::Transformer;
pub use transport::{FrameSink, FrameSource, MemoryTransport, StreamTransport, Transport, WireError};
pub use value::{handler_fn, Call, Capabilities, Function, Handler, Value};

pub use tether_types::{CallError, CallResult, Descriptor, EndpointConfig, Fault, Graph};
