//! Runtime error types.

/// Errors surfaced by the orchestrator handle and the inbound router.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Shutdown has begun; no new work is accepted.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// The dispatch loop has exited.
    #[error("dispatch loop is not running")]
    Stopped,
}

impl RuntimeError {
    /// Error category string for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

/// Errors from delivering a message to the remote transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,

    /// Writing to the underlying channel failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The message could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// Error category string for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Io(_) => "io",
            Self::Encode(_) => "encode",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
