//! Backend error taxonomy.
//!
//! Per-invocation failures never escape as `Err`: they are converted to a
//! terminal `Status{error}` event at the backend boundary. These errors
//! surface from probes, session management calls, and server startup.

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by agent backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The agent tool is missing or did not come up. Not retried.
    #[error("backend unavailable: {message}")]
    Unavailable {
        /// Why the backend could not be reached.
        message: String,
    },

    /// The agent process could not be started.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        /// Executable that failed to start.
        binary: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O failure talking to the agent process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },

    /// The agent broke its wire contract.
    #[error("protocol error: {message}")]
    Protocol {
        /// What was wrong.
        message: String,
    },

    /// The agent process exited unsuccessfully.
    #[error("agent exited with {status}: {stderr}")]
    Exited {
        /// Exit status description.
        status: String,
        /// Sanitized stderr.
        stderr: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl BackendError {
    /// Build an [`BackendError::Unavailable`].
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Build a [`BackendError::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Short classification used as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Spawn { .. } => "spawn",
            Self::Io(_) => "io",
            Self::Http(_) => "network",
            Self::Json(_) | Self::Protocol { .. } => "protocol",
            Self::Status { .. } => "status",
            Self::Exited { .. } => "exit",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Whether the error must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Spawn { .. })
    }

    /// Whether the server reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}
