//! Backend settings: process-exec and server-stream.

use serde::{Deserialize, Serialize};

/// Process-exec backend: one subprocess per prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecSettings {
    /// Agent executable, resolved through `PATH` when not absolute.
    pub binary: String,
    /// Fixed subcommand placed before every other argument.
    pub subcommand: String,
    /// Extra arguments appended after the generated flags.
    pub extra_args: Vec<String>,
    /// Environment variable the credential is passed through.
    pub api_key_env: String,
    /// Credential to forward; when absent the inherited environment is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Working directory for the agent process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Upper bound for the `--version` availability probe.
    pub probe_timeout_ms: u64,
    /// Bytes of stderr kept for diagnostics.
    pub stderr_limit_bytes: usize,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            binary: "droid".to_string(),
            subcommand: "exec".to_string(),
            extra_args: Vec::new(),
            api_key_env: "FACTORY_API_KEY".to_string(),
            api_key: None,
            workdir: None,
            probe_timeout_ms: 5_000,
            stderr_limit_bytes: 16 * 1024,
        }
    }
}

/// Server-stream backend: local HTTP server plus SSE subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Server executable, launched with `serve`.
    pub binary: String,
    /// Attach to an already running server instead of launching one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Bind address for a launched server.
    pub hostname: String,
    /// Port for a launched server.
    pub port: u16,
    /// Upper bound on waiting for a launched server to become healthy.
    pub startup_timeout_ms: u64,
    /// Interval between health probes during startup.
    pub health_poll_interval_ms: u64,
    /// Health endpoint path.
    pub health_path: String,
    /// Stdout substring announcing the server is listening.
    pub ready_marker: String,
    /// Provider prefixed to model names given without one.
    pub default_provider: String,
    /// How long a forwarded permission request waits before it is denied.
    pub permission_timeout_ms: u64,
    /// Upper bound for a synchronous prompt request.
    pub request_timeout_ms: u64,
    /// Post prompts fire-and-forget and end the turn on `session.idle`
    /// instead of on the prompt response.
    pub async_prompts: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            binary: "opencode".to_string(),
            base_url: None,
            hostname: "127.0.0.1".to_string(),
            port: 4096,
            startup_timeout_ms: 10_000,
            health_poll_interval_ms: 200,
            health_path: "/health".to_string(),
            ready_marker: "server listening".to_string(),
            default_provider: "anthropic".to_string(),
            permission_timeout_ms: 300_000,
            request_timeout_ms: 600_000,
            async_prompts: false,
        }
    }
}

impl ServerSettings {
    /// Base URL of the server, launched or external.
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.hostname, self.port),
        }
    }
}
