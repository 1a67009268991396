//! # tether-core
//!
//! Foundation types shared by every tether crate.
//!
//! - **Modes**: [`PermissionMode`] and the immutable [`Mode`] value with its
//!   coalescing fingerprint
//! - **Canonical events**: [`CanonicalEvent`], the only event vocabulary the
//!   orchestrator understands
//! - **Run state**: [`RunState`] for the orchestrator's dispatch loop
//! - **Text helpers**: truncation and sanitization of diagnostic text
//! - **Logging**: subscriber setup and test capture utilities

#![deny(unsafe_code)]

pub mod events;
pub mod logging;
pub mod mode;
pub mod state;
pub mod text;

pub use events::{CanonicalEvent, StatusPhase};
pub use mode::{Mode, ModeParseError, PermissionMode};
pub use state::RunState;
