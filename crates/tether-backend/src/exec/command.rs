//! Command line construction for the process-exec agent.
//!
//! Shape: `<binary> <subcommand> --output-format stream-json [--auto LEVEL]
//! [-m MODEL] [-s SESSION] [--cwd DIR] [EXTRA...] -- PROMPT`.
//!
//! The prompt always follows `--`, so operator text starting with `-` is never
//! read as a flag. The credential travels through the environment only.

use std::process::Stdio;

use tether_core::{Mode, PermissionMode};
use tether_settings::ExecSettings;
use tokio::process::Command;

use crate::backend::BackendSession;

/// Streaming JSON output format flag value.
pub const OUTPUT_FORMAT: &str = "stream-json";

/// Autonomy level for a permission mode; `None` leaves the tool at its most
/// restrictive default.
pub fn autonomy_level(mode: PermissionMode) -> Option<&'static str> {
    match mode {
        PermissionMode::Default | PermissionMode::ReadOnly => None,
        PermissionMode::SafeYolo => Some("medium"),
        PermissionMode::Yolo => Some("high"),
    }
}

/// Arguments for one invocation, excluding the binary itself.
pub fn build_args(
    settings: &ExecSettings,
    mode: &Mode,
    session: Option<&BackendSession>,
    prompt: &str,
) -> Vec<String> {
    let mut args = vec![
        settings.subcommand.clone(),
        "--output-format".to_string(),
        OUTPUT_FORMAT.to_string(),
    ];
    if let Some(level) = autonomy_level(mode.permission_mode) {
        args.push("--auto".to_string());
        args.push(level.to_string());
    }
    if let Some(model) = mode.model.as_deref().filter(|m| !m.is_empty()) {
        args.push("-m".to_string());
        args.push(model.to_string());
    }
    if let Some(session) = session {
        args.push("-s".to_string());
        args.push(session.as_str().to_string());
    }
    if let Some(dir) = &settings.workdir {
        args.push("--cwd".to_string());
        args.push(dir.clone());
    }
    args.extend(settings.extra_args.iter().cloned());
    args.push("--".to_string());
    args.push(prompt.to_string());
    args
}

/// Ready-to-spawn command with piped stdout/stderr and closed stdin.
pub fn build_command(
    settings: &ExecSettings,
    mode: &Mode,
    session: Option<&BackendSession>,
    prompt: &str,
) -> Command {
    let mut cmd = Command::new(&settings.binary);
    let _ = cmd
        .args(build_args(settings, mode, session, prompt))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(key) = &settings.api_key {
        let _ = cmd.env(&settings.api_key_env, key);
    }
    if let Some(dir) = &settings.workdir {
        let _ = cmd.current_dir(dir);
    }
    cmd
}

/// Command for the `--version` availability probe.
pub fn version_command(settings: &ExecSettings) -> Command {
    let mut cmd = Command::new(&settings.binary);
    let _ = cmd
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
