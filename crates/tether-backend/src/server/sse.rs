//! # SSE Parser
//!
//! Server-Sent Events framing for the server's `/event` subscription.
//!
//! - bytes are buffered until a full line is available
//! - `data:` lines accumulate into the current frame
//! - a blank line closes the frame and yields its payload
//! - comments (`:`) and other fields (`event:`, `id:`, `retry:`) are skipped
//! - a final frame without a trailing blank line is flushed at end of stream

use std::fmt::Display;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::warn;

struct FrameState<S> {
    stream: S,
    buffer: BytesMut,
    data: Vec<String>,
    done: bool,
}

/// Split a byte stream into SSE frame payloads.
///
/// Each yielded string is the `data` of one frame, with multi-line data
/// joined by `\n`.
pub fn parse_sse_frames<S, E>(byte_stream: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let state = FrameState {
        stream: byte_stream,
        buffer: BytesMut::with_capacity(8192),
        data: Vec::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            if let Some(newline_pos) = state.buffer.iter().position(|&b| b == b'\n') {
                let mut line_bytes = state.buffer.split_to(newline_pos + 1);
                line_bytes.truncate(line_bytes.len() - 1);
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.truncate(line_bytes.len() - 1);
                }
                let Ok(line) = std::str::from_utf8(&line_bytes) else {
                    continue;
                };

                if line.is_empty() {
                    if let Some(payload) = take_frame(&mut state.data) {
                        return Some((payload, state));
                    }
                    continue;
                }
                if let Some(data) = extract_sse_data(line) {
                    state.data.push(data.to_string());
                }
                continue;
            }

            match state.stream.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    warn!(error = %e, "event stream read error");
                    state.done = true;
                    return take_frame(&mut state.data).map(|payload| (payload, state));
                }
                None => {
                    state.done = true;
                    if let Ok(rest) = std::str::from_utf8(&state.buffer) {
                        if let Some(data) = extract_sse_data(rest.trim_end()) {
                            state.data.push(data.to_string());
                        }
                    }
                    state.buffer.clear();
                    return take_frame(&mut state.data).map(|payload| (payload, state));
                }
            }
        }
    })
}

fn take_frame(data: &mut Vec<String>) -> Option<String> {
    if data.is_empty() {
        return None;
    }
    let payload = data.join("\n");
    data.clear();
    (!payload.trim().is_empty()).then_some(payload)
}

/// Extract the payload of a `data:` line.
///
/// Returns `None` for comments and every other field.
fn extract_sse_data(line: &str) -> Option<&str> {
    if line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

/// Parse a frame payload as JSON, logging and skipping failures.
pub fn parse_sse_data<T: serde::de::DeserializeOwned>(data: &str) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(
                error = %e,
                data_preview = tether_core::text::truncate_str(data, 100),
                "skipping malformed event frame"
            );
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + Unpin + 'static {
        let owned: Vec<Result<Bytes, Infallible>> = parts
            .iter()
            .map(|p| Ok(Bytes::from((*p).to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    // ── extract_sse_data ─────────────────────────────────────────────────

    #[test]
    fn extract_with_and_without_space() {
        assert_eq!(extract_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(extract_sse_data("data:{\"a\":1}"), Some("{\"a\":1}"));
    }

    #[test]
    fn extract_skips_comments_and_other_fields() {
        assert_eq!(extract_sse_data(": keep-alive"), None);
        assert_eq!(extract_sse_data("event: message"), None);
        assert_eq!(extract_sse_data("id: 7"), None);
    }

    // ── parse_sse_frames ─────────────────────────────────────────────────

    #[tokio::test]
    async fn frames_separated_by_blank_lines() {
        let stream = chunks(&["data: {\"n\":1}\n\ndata: {\"n\":2}\n\n"]);
        let frames: Vec<String> = parse_sse_frames(stream).collect().await;
        assert_eq!(frames, vec!["{\"n\":1}", "{\"n\":2}"]);
    }

    #[tokio::test]
    async fn frame_split_across_chunks() {
        let stream = chunks(&["da", "ta: {\"type\":\"ses", "sion.idle\"}\r\n", "\r\n"]);
        let frames: Vec<String> = parse_sse_frames(stream).collect().await;
        assert_eq!(frames, vec!["{\"type\":\"session.idle\"}"]);
    }

    #[tokio::test]
    async fn multi_line_data_joined() {
        let stream = chunks(&["data: line one\ndata: line two\n\n"]);
        let frames: Vec<String> = parse_sse_frames(stream).collect().await;
        assert_eq!(frames, vec!["line one\nline two"]);
    }

    #[tokio::test]
    async fn comments_and_empty_frames_skipped() {
        let stream = chunks(&[": ping\n\nevent: x\n\ndata: {}\n\n"]);
        let frames: Vec<String> = parse_sse_frames(stream).collect().await;
        assert_eq!(frames, vec!["{}"]);
    }

    #[tokio::test]
    async fn trailing_frame_flushed_at_end() {
        let stream = chunks(&["data: {\"last\":true}"]);
        let frames: Vec<String> = parse_sse_frames(stream).collect().await;
        assert_eq!(frames, vec!["{\"last\":true}"]);
    }

    // ── parse_sse_data ───────────────────────────────────────────────────

    #[test]
    fn parse_data_valid_and_invalid() {
        let ok: Option<serde_json::Value> = parse_sse_data("{\"type\":\"x\"}");
        assert_eq!(ok.unwrap()["type"], "x");
        let bad: Option<serde_json::Value> = parse_sse_data("not json");
        assert!(bad.is_none());
    }
}
