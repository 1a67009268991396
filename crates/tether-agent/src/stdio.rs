//! Stdio transport: JSON lines in on stdin, JSON lines out on stdout.

use async_trait::async_trait;
use tether_core::text::truncate_str;
use tether_runtime::{InboundMessage, InboundRouter, OutboundMessage, Transport, TransportError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writes one JSON object per line to `W`.
pub struct StdioTransport<W> {
    writer: Mutex<Option<W>>,
}

impl<W> StdioTransport<W> {
    /// Transport writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl<W> Transport for StdioTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Feed inbound JSON lines to `router` until EOF or shutdown.
///
/// Malformed lines are logged and skipped.
pub async fn pump_inbound<R>(reader: R, router: &InboundRouter, shutdown: &CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = lines.next_line() => next,
        };
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("inbound stream closed");
                break;
            }
            Err(error) => {
                warn!(error = %error, "inbound read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: InboundMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(error) => {
                warn!(
                    error = %error,
                    preview = truncate_str(line, 100),
                    "skipping malformed inbound message"
                );
                continue;
            }
        };
        match router.route(message).await {
            Ok(outcome) => debug!(?outcome, "inbound message routed"),
            Err(error) => warn!(error = %error, category = error.category(), "inbound message rejected"),
        }
    }
}
