//! Managed agent server process.
//!
//! `<binary> serve --hostname H --port P` is spawned and considered ready
//! when either its stdout prints the ready marker or the health endpoint
//! answers, whichever comes first. A server that is not ready within the
//! startup timeout, or exits early, is killed and reported unavailable.

use std::process::Stdio;
use std::time::Duration;

use tether_settings::ServerSettings;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{BackendError, BackendResult};

use super::client::ServerClient;

/// Time allowed for the server to exit after being killed.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

/// A server this backend started and owns.
pub struct ServerProcess {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// OS process id, while running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the server and wait briefly for it to exit.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "server process already gone");
        }
        match tokio::time::timeout(SHUTDOWN_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "server process exited"),
            Ok(Err(e)) => warn!(error = %e, "failed waiting for server process"),
            Err(_) => warn!("server process did not exit after kill"),
        }
        for reader in self.readers {
            reader.abort();
        }
    }
}

/// Arguments for `serve`.
pub fn serve_args(settings: &ServerSettings) -> Vec<String> {
    vec![
        "serve".to_string(),
        "--hostname".to_string(),
        settings.hostname.clone(),
        "--port".to_string(),
        settings.port.to_string(),
    ]
}

/// Start the server and wait until it is ready.
pub async fn launch(settings: &ServerSettings, client: &ServerClient) -> BackendResult<ServerProcess> {
    let mut child = Command::new(&settings.binary)
        .args(serve_args(settings))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BackendError::Spawn {
            binary: settings.binary.clone(),
            source,
        })?;
    info!(
        pid = child.id(),
        url = client.base_url(),
        "starting agent server"
    );

    let (marker_tx, marker_rx) = oneshot::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(watch_output(
            stdout,
            "stdout",
            Some((settings.ready_marker.clone(), marker_tx)),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(watch_output(stderr, "stderr", None)));
    }

    let startup = Duration::from_millis(settings.startup_timeout_ms);
    let poll = Duration::from_millis(settings.health_poll_interval_ms.max(1));
    let ready = tokio::time::timeout(startup, async {
        tokio::select! {
            Ok(()) = marker_rx => Ok(()),
            result = poll_health(client, &settings.health_path, poll, &mut child) => result,
        }
    })
    .await;

    let process = ServerProcess { child, readers };
    match ready {
        Ok(Ok(())) => {
            info!(pid = process.pid(), "agent server ready");
            Ok(process)
        }
        Ok(Err(err)) => {
            process.shutdown().await;
            Err(err)
        }
        Err(_) => {
            process.shutdown().await;
            Err(BackendError::unavailable(format!(
                "{} did not become ready within {}ms",
                settings.binary, settings.startup_timeout_ms
            )))
        }
    }
}

/// Confirm an externally managed server answers its health check.
pub async fn attach(settings: &ServerSettings, client: &ServerClient) -> BackendResult<Option<String>> {
    client
        .health(&settings.health_path)
        .await
        .map_err(|e| BackendError::unavailable(format!("server at {} is unreachable: {e}", client.base_url())))
}

async fn poll_health(
    client: &ServerClient,
    path: &str,
    interval: Duration,
    child: &mut Child,
) -> BackendResult<()> {
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(BackendError::unavailable(format!(
                "server exited during startup with {status}"
            )));
        }
        match client.health(path).await {
            Ok(_) => return Ok(()),
            Err(e) => debug!(error = %e, "server not healthy yet"),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn watch_output<R>(reader: R, stream: &'static str, marker: Option<(String, oneshot::Sender<()>)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut marker = marker;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(stream, line = tether_core::text::truncate_str(&line, 300), "server output");
                let hit = marker
                    .as_ref()
                    .is_some_and(|(needle, _)| !needle.is_empty() && line.contains(needle.as_str()));
                if hit {
                    if let Some((_, tx)) = marker.take() {
                        let _ = tx.send(());
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    mod startup {
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        use assert_matches::assert_matches;
        use tempfile::TempDir;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use super::*;

        /// Nothing listens here, so health checks are refused.
        const DEAD_URL: &str = "http://127.0.0.1:9";

        fn fake_server(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-server");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn settings(binary: &Path, startup_timeout_ms: u64) -> ServerSettings {
            ServerSettings {
                binary: binary.to_string_lossy().into_owned(),
                startup_timeout_ms,
                health_poll_interval_ms: 50,
                ready_marker: "server listening".into(),
                ..ServerSettings::default()
            }
        }

        fn client(base_url: &str) -> ServerClient {
            ServerClient::new(reqwest::Client::new(), base_url, Duration::from_secs(1))
        }

        fn is_running(pid: u32) -> bool {
            std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .status()
                .is_ok_and(|status| status.success())
        }

        #[tokio::test]
        async fn ready_marker_wins_when_health_never_answers() {
            let dir = TempDir::new().unwrap();
            let binary = fake_server(&dir, "echo 'opencode server listening on 4096'\nexec sleep 30");

            let process = launch(&settings(&binary, 5_000), &client(DEAD_URL))
                .await
                .unwrap();
            let pid = process.pid().unwrap();
            assert!(is_running(pid));
            process.shutdown().await;
            assert!(!is_running(pid));
        }

        #[tokio::test]
        async fn health_wins_when_no_marker_is_printed() {
            let dir = TempDir::new().unwrap();
            let binary = fake_server(&dir, "exec sleep 30");
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/health"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(serde_json::json!({"healthy": true, "version": "0.9"})),
                )
                .expect(1..)
                .mount(&server)
                .await;

            let process = launch(&settings(&binary, 5_000), &client(&server.uri()))
                .await
                .unwrap();
            process.shutdown().await;
        }

        #[tokio::test]
        async fn silent_server_times_out_and_is_killed() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("pid");
            let binary = fake_server(
                &dir,
                &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
            );

            let err = launch(&settings(&binary, 300), &client(DEAD_URL))
                .await
                .err()
                .unwrap();
            assert_matches!(&err, BackendError::Unavailable { message } if message.contains("did not become ready within 300ms"));

            let pid: u32 = std::fs::read_to_string(&pid_file)
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            assert!(!is_running(pid));
        }

        #[tokio::test]
        async fn early_exit_is_unavailable() {
            let dir = TempDir::new().unwrap();
            let binary = fake_server(&dir, "exit 2");

            let err = launch(&settings(&binary, 5_000), &client(DEAD_URL))
                .await
                .err()
                .unwrap();
            assert_matches!(&err, BackendError::Unavailable { message } if message.contains("exited during startup"));
        }
    }

    #[test]
    fn serve_args_use_host_and_port() {
        let settings = ServerSettings {
            hostname: "0.0.0.0".into(),
            port: 5000,
            ..ServerSettings::default()
        };
        assert_eq!(
            serve_args(&settings),
            vec!["serve", "--hostname", "0.0.0.0", "--port", "5000"]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let settings = ServerSettings {
            binary: "/nonexistent/agent-server".into(),
            ..ServerSettings::default()
        };
        let client = ServerClient::new(
            reqwest::Client::new(),
            settings.resolved_base_url(),
            Duration::from_secs(1),
        );
        let err = launch(&settings, &client).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn attach_to_dead_server_is_unavailable() {
        let client = ServerClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Duration::from_secs(1),
        );
        let err = attach(&ServerSettings::default(), &client).await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }
}
