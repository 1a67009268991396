//! # Process-Exec Backend
//!
//! Spawns the agent tool once per invocation and reads newline-delimited
//! JSON from its stdout. Stderr is kept for diagnostics only.
//!
//! Terminal status rules:
//! - cancellation → `Status{stopped}`
//! - an agent `error` record → `Status{error}` with its message
//! - exit code 0 → `Status{idle}`
//! - any other exit → `Status{error}` with stderr, or a default message

pub mod command;
pub mod framing;
pub mod translator;

use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tether_core::text::{sanitize_diagnostic, truncate_str};
use tether_core::{CanonicalEvent, Mode, PermissionMode, StatusPhase};
use tether_settings::ExecSettings;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    ActiveGuard, ActiveSlot, AgentBackend, BackendInfo, BackendKind, BackendSession, Invocation,
    InvokeRequest, ModeCell, claim_active,
};
use crate::errors::{BackendError, BackendResult};

use self::framing::LineBuffer;
use self::translator::ExecTranslator;

/// Bytes read from stdout per poll.
const READ_CHUNK: usize = 8192;

/// Agent driven as one subprocess per prompt.
pub struct ExecBackend {
    settings: Arc<ExecSettings>,
    mode: ModeCell,
    active: ActiveSlot,
    next_id: AtomicU64,
    raw_events: bool,
    disposed: AtomicBool,
}

impl ExecBackend {
    /// Backend using `settings`, starting from `defaults`.
    pub fn new(settings: ExecSettings, defaults: Mode) -> Self {
        Self {
            settings: Arc::new(settings),
            mode: ModeCell::new(defaults),
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            raw_events: false,
            disposed: AtomicBool::new(false),
        }
    }

    /// Log every raw stdout record at `trace`.
    #[must_use]
    pub fn with_raw_events(mut self, enabled: bool) -> Self {
        self.raw_events = enabled;
        self
    }

    /// Mode the next invocation will use.
    pub fn current_mode(&self) -> Mode {
        self.mode.snapshot()
    }

    /// Whether an invocation is in flight.
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }
}

#[async_trait]
impl AgentBackend for ExecBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ProcessExec
    }

    async fn probe(&self) -> BackendResult<BackendInfo> {
        let binary = &self.settings.binary;
        let timeout = Duration::from_millis(self.settings.probe_timeout_ms);

        let output = tokio::time::timeout(timeout, command::version_command(&self.settings).output())
            .await
            .map_err(|_| {
                BackendError::unavailable(format!(
                    "{binary} --version did not answer within {}ms",
                    self.settings.probe_timeout_ms
                ))
            })?
            .map_err(|e| BackendError::unavailable(format!("{binary} is not installed: {e}")))?;

        if !output.status.success() {
            return Err(BackendError::unavailable(format!(
                "{binary} --version exited with {}",
                output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string);
        info!(
            binary = %binary,
            version = version.as_deref().unwrap_or("unknown"),
            "agent tool available"
        );
        Ok(BackendInfo {
            kind: BackendKind::ProcessExec,
            version,
        })
    }

    fn invoke(&self, request: InvokeRequest) -> Invocation {
        if self.disposed.load(Ordering::Acquire) {
            return Invocation::failed("backend has been disposed");
        }

        let mode = self.mode.snapshot();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let guard = claim_active(&self.active, id, cancel.clone());

        debug!(
            invocation = id,
            permission_mode = %mode.permission_mode,
            model = mode.model.as_deref().unwrap_or("default"),
            resume = request.session.is_some(),
            "invoking agent process"
        );

        let (session_tx, session_rx) = oneshot::channel();
        let events = run_process(ProcessRun {
            settings: Arc::clone(&self.settings),
            mode,
            request,
            cancel,
            guard,
            session_tx,
            raw_events: self.raw_events,
        });
        Invocation::new(Box::pin(events), session_rx)
    }

    async fn cancel(&self) -> bool {
        let Some(active) = self.active.lock().take() else {
            debug!("cancel requested with no active invocation");
            return false;
        };
        info!(invocation = active.id, "cancelling agent process");
        active.cancel.cancel();
        true
    }

    fn set_model(&self, model: Option<String>) {
        self.mode.set_model(model);
    }

    fn set_permission_mode(&self, mode: PermissionMode) {
        self.mode.set_permission_mode(mode);
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(active) = self.active.lock().take() {
            active.cancel.cancel();
        }
        debug!("process-exec backend disposed");
    }
}

struct ProcessRun {
    settings: Arc<ExecSettings>,
    mode: Mode,
    request: InvokeRequest,
    cancel: CancellationToken,
    guard: ActiveGuard,
    session_tx: oneshot::Sender<BackendSession>,
    raw_events: bool,
}

fn run_process(run: ProcessRun) -> impl Stream<Item = CanonicalEvent> + Send + 'static {
    async_stream::stream! {
        let ProcessRun { settings, mode, request, cancel, guard, session_tx, raw_events } = run;
        let _guard = guard;
        let mut session_tx = Some(session_tx);

        yield CanonicalEvent::status(StatusPhase::Starting);

        let spawned = command::build_command(
            &settings,
            &mode,
            request.session.as_ref(),
            &request.prompt,
        )
        .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let err = BackendError::Spawn { binary: settings.binary.clone(), source };
                warn!(error = %err, category = err.category(), "agent spawn failed");
                yield CanonicalEvent::error(err.to_string());
                return;
            }
        };
        let pid = child.id();
        debug!(pid, "agent process started");

        let mut stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                yield CanonicalEvent::error("agent stdout was not captured");
                return;
            }
        };
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, settings.stderr_limit_bytes)));

        let mut framer = LineBuffer::new();
        let mut translator = ExecTranslator::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut cancelled = false;

        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                read = stdout.read(&mut chunk) => Some(read),
            };
            let Some(read) = read else {
                cancelled = true;
                break;
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    for line in framer.push(&chunk[..n]) {
                        for event in translate_logged(&mut translator, &line, raw_events) {
                            yield event;
                        }
                        forward_session(&translator, &mut session_tx);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed reading agent stdout");
                    break;
                }
            }
        }

        if !cancelled {
            if let Some(rest) = framer.finish() {
                match translator.translate_line(&rest) {
                    Ok(events) => {
                        for event in events {
                            yield event;
                        }
                    }
                    Err(e) => debug!(error = %e, "dropping unterminated trailing record"),
                }
                forward_session(&translator, &mut session_tx);
            }
        }

        let exit = if cancelled {
            None
        } else {
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            }
        };

        let exit = match exit {
            Some(exit) => exit,
            None => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "agent process already gone");
                }
                info!(pid, "agent invocation stopped");
                yield CanonicalEvent::status(StatusPhase::Stopped);
                return;
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        yield terminal_event(&settings.binary, exit, &translator, &stderr);
    }
}

fn translate_logged(translator: &mut ExecTranslator, line: &str, raw: bool) -> Vec<CanonicalEvent> {
    if raw {
        trace!(line = truncate_str(line, 500), "raw agent record");
    }
    match translator.translate_line(line) {
        Ok(events) => events,
        Err(e) => {
            warn!(
                error = %e,
                line = truncate_str(line, 200),
                "skipping malformed agent record"
            );
            Vec::new()
        }
    }
}

fn forward_session(translator: &ExecTranslator, tx: &mut Option<oneshot::Sender<BackendSession>>) {
    if let Some(id) = translator.session_id() {
        if let Some(tx) = tx.take() {
            let _ = tx.send(BackendSession::new(id));
        }
    }
}

fn terminal_event(
    binary: &str,
    exit: std::io::Result<ExitStatus>,
    translator: &ExecTranslator,
    stderr: &str,
) -> CanonicalEvent {
    let status = match exit {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "failed waiting for agent process");
            return CanonicalEvent::error(format!("failed waiting for {binary}: {e}"));
        }
    };

    if let Some(message) = translator.error() {
        warn!(%status, error = message, "agent reported an error");
        return CanonicalEvent::error(message.to_string());
    }
    if status.success() {
        return CanonicalEvent::status(StatusPhase::Idle);
    }

    let err = BackendError::Exited {
        status: status.to_string(),
        stderr: sanitize_diagnostic(stderr),
    };
    warn!(error = %err, category = err.category(), "agent exited unsuccessfully");
    match err {
        BackendError::Exited { stderr, .. } if !stderr.is_empty() => CanonicalEvent::error(stderr),
        _ => CanonicalEvent::error(format!("{binary} exited with {status}")),
    }
}

async fn collect_stderr<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ExecBackend {
        ExecBackend::new(
            ExecSettings {
                binary: "/nonexistent/agent-binary".into(),
                probe_timeout_ms: 500,
                ..ExecSettings::default()
            },
            Mode::default(),
        )
    }

    #[tokio::test]
    async fn cancel_when_idle_reports_nothing() {
        let backend = backend();
        assert!(!backend.cancel().await);
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn probe_missing_binary_is_unavailable() {
        let err = backend().probe().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn setters_affect_next_snapshot() {
        let backend = backend();
        backend.set_model(Some("m".into()));
        backend.set_permission_mode(PermissionMode::Yolo);
        let mode = backend.current_mode();
        assert_eq!(mode.model.as_deref(), Some("m"));
        assert_eq!(mode.permission_mode, PermissionMode::Yolo);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_blocks_invoke() {
        use futures::StreamExt;

        let backend = backend();
        backend.dispose().await;
        backend.dispose().await;
        let events: Vec<_> = backend.invoke(InvokeRequest::new("x")).events.collect().await;
        assert_eq!(events.last().and_then(CanonicalEvent::phase), Some(StatusPhase::Error));
    }

    #[test]
    fn stderr_preferred_for_exit_detail() {
        use std::os::unix::process::ExitStatusExt;

        let translator = ExecTranslator::new();
        let event = terminal_event("droid", Ok(ExitStatus::from_raw(256)), &translator, "bad key\n");
        assert_eq!(event, CanonicalEvent::error("bad key"));

        let event = terminal_event("droid", Ok(ExitStatus::from_raw(256)), &translator, "");
        assert!(matches!(
            event,
            CanonicalEvent::Status { detail: Some(ref d), .. } if d.starts_with("droid exited with")
        ));
    }

    #[test]
    fn success_is_idle_unless_agent_reported_error() {
        use std::os::unix::process::ExitStatusExt;

        let translator = ExecTranslator::new();
        let event = terminal_event("droid", Ok(ExitStatus::from_raw(0)), &translator, "");
        assert_eq!(event, CanonicalEvent::status(StatusPhase::Idle));

        let mut failing = ExecTranslator::new();
        let _ = failing
            .translate_line(r#"{"type":"error","message":"rate limited"}"#)
            .unwrap();
        let event = terminal_event("droid", Ok(ExitStatus::from_raw(0)), &failing, "");
        assert_eq!(event, CanonicalEvent::error("rate limited"));
    }
}
