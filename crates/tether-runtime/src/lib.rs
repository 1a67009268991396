//! # tether-runtime
//!
//! The session orchestrator and the plumbing around it.
//!
//! - [`MessageQueue`]: pending prompts, each carrying its own [`Mode`]
//! - [`Orchestrator`]: the single dispatch loop that owns the backend and
//!   the [`RunState`]
//! - [`OrchestratorHandle`]: cloneable front door for producers and observers
//! - [`InboundRouter`]: transport messages to queue items, aborts and
//!   permission answers
//! - [`OutboundBridge`]: orchestrator events to the transport vocabulary
//!   over a bounded, lossless channel, plus the keep-alive pulse
//! - [`ShutdownCoordinator`]: token-based shutdown with a bounded drain
//!
//! [`Mode`]: tether_core::Mode
//! [`RunState`]: tether_core::RunState

#![deny(unsafe_code)]

pub mod bridge;
pub mod emitter;
pub mod errors;
pub mod orchestrator;
pub mod queue;
pub mod router;
pub mod shutdown;
pub mod transport;

pub use bridge::{OutboundBridge, run_keep_alive, to_outbound};
pub use emitter::{EventEmitter, OrchestratorEvent};
pub use errors::{RuntimeError, TransportError};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use queue::{MessageQueue, QueueItem};
pub use router::{InboundMessage, InboundRouter, MessageMeta, RouteOutcome};
pub use shutdown::ShutdownCoordinator;
pub use transport::{OutboundMessage, Transport};
