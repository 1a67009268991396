//! Translation of server feed events and prompt responses into canonical
//! events.
//!
//! The live feed and the final response describe the same turn, so the
//! translator remembers what it already emitted:
//! - text is streamed from part updates; the response's text is emitted as
//!   `full_text` only when it differs from what was streamed
//! - each tool call id yields at most one `ToolCall` and one `ToolResult`
//! - a file reported by a tool result is not reported again by `file.edited`

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use tether_core::{CanonicalEvent, StatusPhase};

use crate::exec::translator::derived_events;

use super::types::{MessageResponse, Part, ServerEvent};

/// Session-level outcome carried by a feed event.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionSignal {
    /// The session finished its turn.
    Idle,
    /// The session failed.
    Error(String),
    /// The agent asks before using a tool.
    Permission(PermissionAsk),
}

/// A permission request raised by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct PermissionAsk {
    /// Permission id used when answering.
    pub id: String,
    /// Human-readable reason.
    pub reason: String,
    /// Raw request details.
    pub payload: Value,
}

impl PermissionAsk {
    /// Canonical event forwarding this request upstream.
    pub fn to_event(&self) -> CanonicalEvent {
        CanonicalEvent::PermissionRequest {
            id: self.id.clone(),
            reason: self.reason.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Result of translating one feed event.
#[derive(Debug, Default, PartialEq)]
pub struct Translated {
    /// Content events, in order.
    pub events: Vec<CanonicalEvent>,
    /// Session-level outcome, if the event carried one.
    pub signal: Option<SessionSignal>,
}

impl Translated {
    fn events(events: Vec<CanonicalEvent>) -> Self {
        Self {
            events,
            signal: None,
        }
    }

    fn signal(signal: SessionSignal) -> Self {
        Self {
            events: Vec::new(),
            signal: Some(signal),
        }
    }
}

/// Result of translating a prompt response.
#[derive(Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// Events not already emitted from the live feed, then token usage.
    pub events: Vec<CanonicalEvent>,
    /// Error the assistant message ended with.
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ToolPhase {
    Called,
    Finished,
}

/// Per-invocation translator bound to one server session.
#[derive(Debug)]
pub struct ServerTranslator {
    session_id: String,
    tools: HashMap<String, ToolPhase>,
    part_text: HashMap<String, String>,
    user_messages: HashSet<String>,
    edited_files: HashSet<String>,
    streamed: String,
    running_reported: bool,
}

impl ServerTranslator {
    /// Translator for events of `session_id`.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tools: HashMap::new(),
            part_text: HashMap::new(),
            user_messages: HashSet::new(),
            edited_files: HashSet::new(),
            streamed: String::new(),
            running_reported: false,
        }
    }

    /// Text streamed so far.
    pub fn streamed_text(&self) -> &str {
        &self.streamed
    }

    /// Translate one feed event.
    ///
    /// Events for other sessions yield nothing, and so do events that name no
    /// session: the feed is shared by every session on the server.
    pub fn translate_event(&mut self, event: &ServerEvent) -> Translated {
        if event.session_id() != Some(self.session_id.as_str()) {
            return Translated::default();
        }
        let props = &event.properties;

        match event.kind.as_str() {
            "message.updated" => {
                let info = props.get("info");
                let role = info.and_then(|i| i.get("role")).and_then(Value::as_str);
                if role == Some("user") {
                    if let Some(id) = info.and_then(|i| i.get("id")).and_then(Value::as_str) {
                        let _ = self.user_messages.insert(id.to_string());
                    }
                }
                Translated::default()
            }
            "message.part.updated" => {
                let Some(part) = props
                    .get("part")
                    .and_then(|p| serde_json::from_value::<Part>(p.clone()).ok())
                else {
                    return Translated::default();
                };
                let delta = props.get("delta").and_then(Value::as_str);
                Translated::events(self.part_events(&part, delta))
            }
            "session.status" => {
                let status = props
                    .get("status")
                    .and_then(|s| s.get("type"))
                    .and_then(Value::as_str);
                match status {
                    Some("idle") => Translated::signal(SessionSignal::Idle),
                    Some("busy") if !self.running_reported => {
                        self.running_reported = true;
                        Translated::events(vec![CanonicalEvent::status(StatusPhase::Running)])
                    }
                    _ => Translated::default(),
                }
            }
            "session.idle" => Translated::signal(SessionSignal::Idle),
            "session.error" => Translated::signal(SessionSignal::Error(error_message(
                props.get("error").unwrap_or(&Value::Null),
            ))),
            "permission.updated" | "permission.asked" => match permission_ask(props) {
                Some(ask) => Translated::signal(SessionSignal::Permission(ask)),
                None => Translated::default(),
            },
            "file.edited" => {
                let Some(file) = props.get("file").and_then(Value::as_str) else {
                    return Translated::default();
                };
                if !self.edited_files.insert(file.to_string()) {
                    return Translated::default();
                }
                Translated::events(vec![CanonicalEvent::FileEdit {
                    description: format!("edited {file}"),
                    diff: None,
                }])
            }
            _ => Translated::default(),
        }
    }

    /// Translate the finished assistant message of a synchronous prompt.
    pub fn translate_response(&mut self, response: &MessageResponse) -> BatchOutcome {
        let mut events = Vec::new();
        let mut text = String::new();
        for part in &response.parts {
            match part.kind.as_str() {
                "text" if !part.synthetic => {
                    if let Some(t) = &part.text {
                        text.push_str(t);
                    }
                }
                "tool" => events.extend(self.tool_events(part)),
                _ => {}
            }
        }

        if !text.trim().is_empty() && text.trim() != self.streamed.trim() {
            events.push(CanonicalEvent::full_text(text));
        }

        let duration_ms = response
            .info
            .time
            .as_ref()
            .and_then(|t| Some(t.completed?.saturating_sub(t.created?)))
            .unwrap_or(0);
        events.push(CanonicalEvent::TokenUsage {
            turns: 1,
            duration_ms,
        });

        BatchOutcome {
            events,
            error: response.info.error.as_ref().map(error_message),
        }
    }

    fn part_events(&mut self, part: &Part, delta: Option<&str>) -> Vec<CanonicalEvent> {
        match part.kind.as_str() {
            "text" => self.text_events(part, delta),
            "tool" => self.tool_events(part),
            _ => Vec::new(),
        }
    }

    fn text_events(&mut self, part: &Part, delta: Option<&str>) -> Vec<CanonicalEvent> {
        if part.synthetic {
            return Vec::new();
        }
        if part
            .message_id
            .as_ref()
            .is_some_and(|id| self.user_messages.contains(id))
        {
            return Vec::new();
        }

        let seen = self.part_text.entry(part.id.clone()).or_default();
        let fresh = match (delta, part.text.as_deref()) {
            (Some(delta), full) => {
                let next = full.map_or_else(|| format!("{seen}{delta}"), str::to_string);
                *seen = next;
                delta.to_string()
            }
            (None, Some(full)) if full.len() > seen.len() && full.starts_with(seen.as_str()) => {
                let fresh = full[seen.len()..].to_string();
                *seen = full.to_string();
                fresh
            }
            _ => String::new(),
        };
        if fresh.is_empty() {
            return Vec::new();
        }
        self.streamed.push_str(&fresh);
        vec![CanonicalEvent::text_delta(fresh)]
    }

    fn tool_events(&mut self, part: &Part) -> Vec<CanonicalEvent> {
        let Some(state) = &part.state else {
            return Vec::new();
        };
        let call_id = part.call_id.clone().unwrap_or_else(|| part.id.clone());
        let name = part.tool.clone().unwrap_or_else(|| "tool".to_string());
        let phase = self.tools.get(&call_id).copied();
        let mut events = Vec::new();

        match state.status.as_str() {
            "running" if phase.is_none() => {
                events.push(CanonicalEvent::ToolCall {
                    name,
                    args: state.input.clone(),
                    call_id: call_id.clone(),
                });
                let _ = self.tools.insert(call_id, ToolPhase::Called);
            }
            status @ ("completed" | "error") if phase != Some(ToolPhase::Finished) => {
                if phase.is_none() {
                    events.push(CanonicalEvent::ToolCall {
                        name: name.clone(),
                        args: state.input.clone(),
                        call_id: call_id.clone(),
                    });
                }
                let output = state.output.clone().unwrap_or(Value::Null);
                let result = if status == "error" {
                    json!({ "error": state.error.clone().unwrap_or_default() })
                } else {
                    output.clone()
                };
                events.push(CanonicalEvent::ToolResult {
                    name: name.clone(),
                    result,
                    call_id: call_id.clone(),
                });
                if status == "completed" {
                    let payload = state
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("diff"))
                        .cloned()
                        .unwrap_or(output);
                    let derived = derived_events(&name, &state.input, &payload);
                    if derived
                        .iter()
                        .any(|e| matches!(e, CanonicalEvent::FileEdit { .. }))
                    {
                        if let Some(path) = ["filePath", "file_path", "path"]
                            .iter()
                            .find_map(|k| state.input.get(*k).and_then(Value::as_str))
                        {
                            let _ = self.edited_files.insert(path.to_string());
                        }
                    }
                    events.extend(derived);
                }
                let _ = self.tools.insert(call_id, ToolPhase::Finished);
            }
            _ => {}
        }
        events
    }
}

fn permission_ask(props: &Value) -> Option<PermissionAsk> {
    let id = props
        .get("id")
        .or_else(|| props.get("requestID"))
        .and_then(Value::as_str)?;
    let reason = props
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            props
                .get("tool")
                .or_else(|| props.get("type"))
                .and_then(Value::as_str)
                .map(|tool| format!("{tool} requires approval"))
        })
        .unwrap_or_else(|| "tool requires approval".to_string());
    Some(PermissionAsk {
        id: id.to_string(),
        reason,
        payload: props.clone(),
    })
}

/// Human-readable message out of the server's error shapes:
/// a string, `{message}`, or `{name, data: {message}}`.
fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Object(map) => map
            .get("data")
            .and_then(|d| d.get("message"))
            .or_else(|| map.get("message"))
            .or_else(|| map.get("name"))
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string),
        _ => "agent session failed".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
