//! # tether-backend
//!
//! Agent backend abstraction and its two implementations.
//!
//! - [`AgentBackend`]: invoke a prompt, stream [`CanonicalEvent`]s, cancel,
//!   reconfigure, dispose
//! - [`exec::ExecBackend`]: one subprocess per prompt, NDJSON on stdout
//! - [`server::ServerBackend`]: long-lived local HTTP server with an SSE
//!   subscription
//! - [`PermissionBroker`]: parks forwarded permission requests until the
//!   operator answers or the wait times out
//! - [`factory::create_backend`]: build the configured backend from settings
//!
//! [`CanonicalEvent`]: tether_core::CanonicalEvent

#![deny(unsafe_code)]

pub mod backend;
pub mod errors;
pub mod exec;
pub mod factory;
pub mod permissions;
pub mod server;

pub use backend::{
    AgentBackend, BackendInfo, BackendKind, BackendSession, CanonicalEventStream, Invocation,
    InvokeRequest, ModeCell,
};
pub use errors::{BackendError, BackendResult};
pub use permissions::{PermissionBroker, PermissionDecision};
