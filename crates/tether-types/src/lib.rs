//! Core types for the Tether RPC engine.
//!
//! This crate defines the data shared by both sides of a Tether channel: the
//! serialized value graph that crosses the boundary, the caller-visible error
//! taxonomy, and endpoint configuration. It contains no protocol logic.

pub mod config;
pub mod error;
pub mod graph;

pub use config::EndpointConfig;
pub use error::{CallError, CallResult, Fault};
pub use graph::{Descriptor, Graph, Node, Slot};
