//! Translation of process-exec NDJSON records into canonical events.
//!
//! Record types handled:
//! - `system` (init): carries the continuation token, emits nothing
//! - `message` (assistant): incremental text
//! - `tool_call` / `tool_result`: tool activity, plus derived file edits and
//!   terminal output
//! - `completion`: final text (only when it differs from what was already
//!   streamed) followed by token usage
//! - `error`: recorded and reported as the terminal error at process exit
//!
//! Unknown record types are ignored.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Value, json};
use tether_core::CanonicalEvent;

/// Tools whose result means a file changed.
const FILE_TOOLS: &[&str] = &[
    "edit",
    "multiedit",
    "create",
    "write",
    "applypatch",
    "apply_patch",
    "str_replace",
];

/// Tools whose result is shell output.
const SHELL_TOOLS: &[&str] = &["execute", "bash", "shell", "run", "terminal"];

/// One line of agent stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecRecord {
    /// Session bootstrap.
    System {
        /// Record subtype, usually `init`.
        #[serde(default)]
        subtype: Option<String>,
        /// Continuation token.
        #[serde(default, alias = "sessionId")]
        session_id: Option<String>,
    },
    /// Conversation message.
    Message {
        /// `assistant` or `user`.
        #[serde(default)]
        role: Option<String>,
        /// Message text.
        #[serde(default)]
        text: Option<String>,
        /// Continuation token, when repeated here.
        #[serde(default, alias = "sessionId")]
        session_id: Option<String>,
    },
    /// Tool invocation.
    ToolCall {
        /// Call identifier.
        #[serde(default)]
        id: Option<String>,
        /// Tool name.
        #[serde(default, rename = "toolName", alias = "name")]
        tool_name: Option<String>,
        /// Tool arguments.
        #[serde(default, alias = "arguments")]
        parameters: Option<Value>,
    },
    /// Tool outcome.
    ToolResult {
        /// Call identifier.
        #[serde(default)]
        id: Option<String>,
        /// Call identifier, alternate spelling.
        #[serde(default, rename = "toolId")]
        tool_id: Option<String>,
        /// Tool name, when repeated here.
        #[serde(default, rename = "toolName")]
        tool_name: Option<String>,
        /// Result payload.
        #[serde(default)]
        value: Option<Value>,
        /// Result payload, alternate spelling.
        #[serde(default)]
        output: Option<Value>,
        /// Result payload, alternate spelling.
        #[serde(default)]
        content: Option<Value>,
        /// Whether the tool failed.
        #[serde(default, rename = "isError")]
        is_error: bool,
    },
    /// End of the run.
    Completion {
        /// Authoritative final answer.
        #[serde(default, rename = "finalText")]
        final_text: Option<String>,
        /// Agent turns taken.
        #[serde(default, rename = "numTurns")]
        num_turns: Option<u32>,
        /// Run duration.
        #[serde(default, rename = "durationMs")]
        duration_ms: Option<u64>,
        /// Continuation token, when repeated here.
        #[serde(default, alias = "sessionId")]
        session_id: Option<String>,
    },
    /// Agent-reported failure.
    Error {
        /// Failure description.
        #[serde(default)]
        message: Option<String>,
    },
    /// Anything else.
    #[serde(other)]
    Unknown,
}

#[derive(Debug)]
struct PendingTool {
    name: String,
    args: Value,
}

/// Stateful translator for one invocation.
#[derive(Debug, Default)]
pub struct ExecTranslator {
    session_id: Option<String>,
    streamed_text: String,
    tools: HashMap<String, PendingTool>,
    next_call: u64,
    completed: bool,
    error: Option<String>,
}

impl ExecTranslator {
    /// Fresh translator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and translate one stdout line.
    pub fn translate_line(&mut self, line: &str) -> Result<Vec<CanonicalEvent>, serde_json::Error> {
        let record: ExecRecord = serde_json::from_str(line)?;
        Ok(self.translate(record))
    }

    /// Translate one parsed record.
    pub fn translate(&mut self, record: ExecRecord) -> Vec<CanonicalEvent> {
        match record {
            ExecRecord::System { session_id, .. } => {
                self.observe_session(session_id);
                Vec::new()
            }
            ExecRecord::Message {
                role,
                text,
                session_id,
            } => {
                self.observe_session(session_id);
                if role.as_deref().is_some_and(|r| r != "assistant") {
                    return Vec::new();
                }
                match text.filter(|t| !t.is_empty()) {
                    Some(text) => {
                        self.streamed_text.push_str(&text);
                        vec![CanonicalEvent::text_delta(text)]
                    }
                    None => Vec::new(),
                }
            }
            ExecRecord::ToolCall {
                id,
                tool_name,
                parameters,
            } => {
                let call_id = id.unwrap_or_else(|| self.synthetic_call_id());
                let name = tool_name.unwrap_or_else(|| "tool".to_string());
                let args = parameters.map_or_else(|| json!({}), normalize_args);
                let _ = self.tools.insert(
                    call_id.clone(),
                    PendingTool {
                        name: name.clone(),
                        args: args.clone(),
                    },
                );
                vec![CanonicalEvent::ToolCall {
                    name,
                    args,
                    call_id,
                }]
            }
            ExecRecord::ToolResult {
                id,
                tool_id,
                tool_name,
                value,
                output,
                content,
                is_error,
            } => {
                let call_id = id.or(tool_id).unwrap_or_else(|| self.synthetic_call_id());
                let pending = self.tools.remove(&call_id);
                let name = pending
                    .as_ref()
                    .map(|p| p.name.clone())
                    .or(tool_name)
                    .unwrap_or_else(|| "tool".to_string());
                let payload = value.or(output).or(content).unwrap_or(Value::Null);
                let result = if is_error {
                    json!({ "error": payload.clone() })
                } else {
                    payload.clone()
                };

                let mut events = vec![CanonicalEvent::ToolResult {
                    name: name.clone(),
                    result,
                    call_id,
                }];
                if !is_error {
                    let args = pending.map_or(Value::Null, |p| p.args);
                    events.extend(derived_events(&name, &args, &payload));
                }
                events
            }
            ExecRecord::Completion {
                final_text,
                num_turns,
                duration_ms,
                session_id,
            } => {
                self.observe_session(session_id);
                self.completed = true;
                let mut events = Vec::new();
                if let Some(text) = final_text.filter(|t| !t.is_empty()) {
                    if text.trim() != self.streamed_text.trim() {
                        events.push(CanonicalEvent::full_text(text));
                    }
                }
                events.push(CanonicalEvent::TokenUsage {
                    turns: num_turns.unwrap_or(1),
                    duration_ms: duration_ms.unwrap_or(0),
                });
                events
            }
            ExecRecord::Error { message } => {
                self.error = Some(message.unwrap_or_else(|| "agent reported an error".to_string()));
                Vec::new()
            }
            ExecRecord::Unknown => Vec::new(),
        }
    }

    /// Continuation token, once seen.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Concatenation of every assistant text delta emitted so far.
    pub fn streamed_text(&self) -> &str {
        &self.streamed_text
    }

    /// Whether a completion record was seen.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Error reported by the agent, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn observe_session(&mut self, session_id: Option<String>) {
        if self.session_id.is_none() {
            self.session_id = session_id.filter(|s| !s.is_empty());
        }
    }

    fn synthetic_call_id(&mut self) -> String {
        self.next_call += 1;
        format!("call-{}", self.next_call)
    }
}

/// Tool arguments sometimes arrive as a JSON-encoded string.
fn normalize_args(args: Value) -> Value {
    match args {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn arg_str<'a>(args: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| args.get(*k).and_then(Value::as_str))
}

pub(crate) fn derived_events(name: &str, args: &Value, payload: &Value) -> Vec<CanonicalEvent> {
    let lowered = name.to_ascii_lowercase();
    if FILE_TOOLS.contains(&lowered.as_str()) {
        let path = arg_str(args, &["file_path", "filePath", "path"]).unwrap_or("file");
        let diff = arg_str(args, &["diff", "patch"]).map(str::to_string).or_else(|| {
            let text = value_text(payload);
            (text.contains("\n@@") || text.starts_with("@@") || text.starts_with("--- "))
                .then_some(text)
        });
        return vec![CanonicalEvent::FileEdit {
            description: format!("{name} {path}"),
            diff,
        }];
    }
    if SHELL_TOOLS.contains(&lowered.as_str()) {
        let data = value_text(payload);
        if !data.is_empty() {
            return vec![CanonicalEvent::TerminalOutput { data }];
        }
    }
    Vec::new()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn run(lines: &[&str]) -> (ExecTranslator, Vec<CanonicalEvent>) {
        let mut translator = ExecTranslator::new();
        let mut events = Vec::new();
        for line in lines {
            events.extend(translator.translate_line(line).unwrap());
        }
        (translator, events)
    }

    // ── basic turn ──────────────────────────────────────────────────

    #[test]
    fn basic_turn_streams_text_and_usage() {
        let (translator, events) = run(&[
            r#"{"type":"system","subtype":"init","session_id":"s-1"}"#,
            r#"{"type":"message","role":"assistant","text":"a.txt\nb.txt"}"#,
            r#"{"type":"completion","finalText":"a.txt\nb.txt","numTurns":1,"durationMs":42}"#,
        ]);
        assert_eq!(
            events,
            vec![
                CanonicalEvent::text_delta("a.txt\nb.txt"),
                CanonicalEvent::TokenUsage {
                    turns: 1,
                    duration_ms: 42
                },
            ]
        );
        assert_eq!(translator.session_id(), Some("s-1"));
        assert!(translator.is_completed());
    }

    #[test]
    fn final_text_emitted_when_not_streamed() {
        let (_, events) = run(&[r#"{"type":"completion","finalText":"done","numTurns":2}"#]);
        assert_eq!(events[0], CanonicalEvent::full_text("done"));
        assert_matches!(events[1], CanonicalEvent::TokenUsage { turns: 2, .. });
    }

    #[test]
    fn user_messages_are_ignored() {
        let (translator, events) =
            run(&[r#"{"type":"message","role":"user","text":"list files"}"#]);
        assert!(events.is_empty());
        assert!(translator.streamed_text().is_empty());
    }

    #[test]
    fn emitted_deltas_reproduce_the_assistant_text() {
        let (_, events) = run(&[
            r#"{"type":"system","subtype":"init","session_id":"s-2"}"#,
            r#"{"type":"message","role":"user","text":"summarize the readme"}"#,
            r#"{"type":"message","role":"assistant","text":"The readme "}"#,
            r#"{"type":"message","role":"assistant","text":"describes a CLI,\n"}"#,
            r#"{"type":"message","role":"assistant","text":"its flags and its config file."}"#,
            r#"{"type":"completion","finalText":"The readme describes a CLI,\nits flags and its config file.","numTurns":1}"#,
        ]);

        let text: String = events.iter().filter_map(CanonicalEvent::delta).collect();
        assert_eq!(text, "The readme describes a CLI,\nits flags and its config file.");
        assert!(
            !events.iter().any(|e| matches!(
                e,
                CanonicalEvent::ModelOutput {
                    full_text: Some(_),
                    ..
                }
            )),
            "final text matching the stream must not be repeated"
        );
        assert_matches!(events.last(), Some(CanonicalEvent::TokenUsage { turns: 1, .. }));
    }

    // ── tools ───────────────────────────────────────────────────────

    #[test]
    fn tool_call_and_result_pair_by_id() {
        let (_, events) = run(&[
            r#"{"type":"tool_call","id":"t1","toolName":"Grep","parameters":{"pattern":"fn"}}"#,
            r#"{"type":"tool_result","id":"t1","value":"src/lib.rs:1"}"#,
        ]);
        assert_eq!(
            events[0],
            CanonicalEvent::ToolCall {
                name: "Grep".into(),
                args: json!({"pattern": "fn"}),
                call_id: "t1".into()
            }
        );
        assert_eq!(
            events[1],
            CanonicalEvent::ToolResult {
                name: "Grep".into(),
                result: json!("src/lib.rs:1"),
                call_id: "t1".into()
            }
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn generic_tool_call_spelling_with_string_args() {
        let (_, events) = run(&[r#"{"type":"tool_call","name":"Read","arguments":"{\"path\":\"a\"}"}"#]);
        assert_matches!(
            &events[0],
            CanonicalEvent::ToolCall { name, args, call_id } => {
                assert_eq!(name, "Read");
                assert_eq!(args, &json!({"path": "a"}));
                assert_eq!(call_id, "call-1");
            }
        );
    }

    #[test]
    fn edit_tool_derives_file_edit() {
        let (_, events) = run(&[
            r#"{"type":"tool_call","id":"e1","toolName":"Edit","parameters":{"file_path":"src/main.rs"}}"#,
            r#"{"type":"tool_result","id":"e1","value":"@@ -1 +1 @@\n-a\n+b"}"#,
        ]);
        assert_eq!(events.len(), 3);
        assert_matches!(
            &events[2],
            CanonicalEvent::FileEdit { description, diff } => {
                assert_eq!(description, "Edit src/main.rs");
                assert!(diff.as_deref().unwrap().starts_with("@@"));
            }
        );
    }

    #[test]
    fn shell_tool_derives_terminal_output() {
        let (_, events) = run(&[
            r#"{"type":"tool_call","id":"x1","toolName":"Execute","parameters":{"command":"ls"}}"#,
            r#"{"type":"tool_result","id":"x1","output":"a.txt\nb.txt"}"#,
        ]);
        assert_eq!(
            events[2],
            CanonicalEvent::TerminalOutput {
                data: "a.txt\nb.txt".into()
            }
        );
    }

    #[test]
    fn failed_tool_result_wraps_error_and_derives_nothing() {
        let (_, events) = run(&[
            r#"{"type":"tool_call","id":"e2","toolName":"Edit","parameters":{"file_path":"x"}}"#,
            r#"{"type":"tool_result","id":"e2","value":"denied","isError":true}"#,
        ]);
        assert_eq!(events.len(), 2);
        assert_matches!(&events[1], CanonicalEvent::ToolResult { result, .. } => {
            assert_eq!(result, &json!({"error": "denied"}));
        });
    }

    // ── errors and unknowns ─────────────────────────────────────────

    #[test]
    fn error_record_is_held_for_exit() {
        let (translator, events) = run(&[r#"{"type":"error","message":"quota exceeded"}"#]);
        assert!(events.is_empty());
        assert_eq!(translator.error(), Some("quota exceeded"));
    }

    #[test]
    fn unknown_type_ignored() {
        let (_, events) = run(&[r#"{"type":"thinking","text":"hmm"}"#]);
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_line_is_an_error() {
        let mut translator = ExecTranslator::new();
        assert!(translator.translate_line("{not json").is_err());
        assert!(translator.translate_line(r#"{"no_type":1}"#).is_err());
    }

    #[test]
    fn first_session_id_wins() {
        let (translator, _) = run(&[
            r#"{"type":"system","subtype":"init","session_id":"first"}"#,
            r#"{"type":"completion","finalText":"x","session_id":"second"}"#,
        ]);
        assert_eq!(translator.session_id(), Some("first"));
    }
}
