//! Server-stream backend against an in-process fake agent server.
//!
//! The fake server answers the REST surface and relays scripted events over
//! `/event`. The prompt text selects the script.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tether_backend::server::ServerBackend;
use tether_backend::{AgentBackend, BackendSession, InvokeRequest, PermissionDecision};
use tether_core::{CanonicalEvent, Mode, PermissionMode, StatusPhase};
use tether_settings::ServerSettings;
use tokio::sync::broadcast;

// ── fake server ──────────────────────────────────────────────────────────

#[derive(Clone)]
struct Fake {
    /// `None` closes every open event stream.
    feed: broadcast::Sender<Option<Value>>,
    creates: Arc<AtomicUsize>,
    aborts: Arc<Mutex<Vec<String>>>,
    decisions: Arc<Mutex<Vec<(String, String)>>>,
}

impl Fake {
    fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self {
            feed,
            creates: Arc::new(AtomicUsize::new(0)),
            aborts: Arc::new(Mutex::new(Vec::new())),
            decisions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn publish(&self, event: Value) {
        let _ = self.feed.send(Some(event));
    }

    fn publish_turn(&self, session: &str) {
        self.publish(text_delta(session, "Hel", "Hel"));
        self.publish(text_delta(session, "Hello", "lo"));
        self.publish(tool(session, "running", None));
        self.publish(tool(session, "completed", Some("a.txt")));
    }
}

fn text_delta(session: &str, text: &str, delta: &str) -> Value {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {"id": "p1", "sessionID": session, "messageID": "m1", "type": "text", "text": text},
            "delta": delta
        }
    })
}

fn tool(session: &str, status: &str, output: Option<&str>) -> Value {
    let mut state = json!({"status": status, "input": {"path": "."}});
    if let Some(output) = output {
        state["output"] = json!(output);
    }
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": "t1", "sessionID": session, "messageID": "m1",
                "type": "tool", "tool": "list", "callID": "call_1", "state": state
            }
        }
    })
}

fn prompt_text(body: &Value) -> String {
    body["parts"][0]["text"].as_str().unwrap_or_default().to_string()
}

async fn health() -> Json<Value> {
    Json(json!({"healthy": true, "version": "fake-1"}))
}

async fn create_session(State(fake): State<Fake>) -> Json<Value> {
    let n = fake.creates.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"id": format!("ses_{n}")}))
}

async fn get_session(Path(id): Path<String>) -> Response {
    if id.starts_with("ses_") {
        Json(json!({"id": id})).into_response()
    } else {
        (StatusCode::NOT_FOUND, "session not found").into_response()
    }
}

async fn list_sessions() -> Json<Value> {
    Json(json!([{"id": "ses_1", "title": "first"}]))
}

async fn message(State(fake): State<Fake>, Path(id): Path<String>, Json(body): Json<Value>) -> Response {
    match prompt_text(&body).as_str() {
        "hi" => {
            fake.publish_turn(&id);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Json(json!({
                "info": {"id": "m1", "role": "assistant", "sessionID": id,
                         "time": {"created": 100, "completed": 400}},
                "parts": [
                    {"id": "p1", "type": "text", "text": "Hello"},
                    {"id": "t1", "type": "tool", "tool": "list", "callID": "call_1",
                     "state": {"status": "completed", "input": {"path": "."}, "output": "a.txt"}}
                ]
            }))
            .into_response()
        }
        "ask" => {
            fake.publish(json!({
                "type": "permission.updated",
                "properties": {"id": "per_1", "sessionID": id, "type": "bash", "title": "Run make"}
            }));
            let mut decision = None;
            for _ in 0..100 {
                decision = fake.decisions.lock().first().map(|(_, d)| d.clone());
                if decision.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let text = format!("decision: {}", decision.unwrap_or_default());
            Json(json!({
                "info": {"id": "m2", "role": "assistant", "sessionID": id},
                "parts": [{"id": "p2", "type": "text", "text": text}]
            }))
            .into_response()
        }
        "fail" => {
            fake.publish(json!({
                "type": "session.error",
                "properties": {"sessionID": id, "error": {"name": "ProviderAuthError", "data": {"message": "bad key"}}}
            }));
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        "drop" => {
            let _ = fake.feed.send(None);
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        "broken" => (StatusCode::BAD_REQUEST, "model not found").into_response(),
        // "hang" and anything else: never answers in time
        _ => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn prompt_async(State(fake): State<Fake>, Path(id): Path<String>) -> StatusCode {
    drop(tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fake.publish(text_delta(&id, "async", "async"));
        fake.publish(json!({"type": "session.idle", "properties": {"sessionID": id}}));
    }));
    StatusCode::NO_CONTENT
}

async fn abort(State(fake): State<Fake>, Path(id): Path<String>) -> Json<Value> {
    fake.aborts.lock().push(id);
    Json(json!(true))
}

async fn permission(
    State(fake): State<Fake>,
    Path((_, permission_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let decision = body["response"].as_str().unwrap_or_default().to_string();
    fake.decisions.lock().push((permission_id, decision));
    Json(json!(true))
}

async fn events(State(fake): State<Fake>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = fake.feed.subscribe();
    let stream = async_stream::stream! {
        yield Ok(Event::default().data(json!({"type": "server.connected", "properties": {}}).to_string()));
        while let Ok(Some(event)) = rx.recv().await {
            yield Ok(Event::default().data(event.to_string()));
        }
    };
    Sse::new(stream)
}

async fn start_fake() -> (Fake, String) {
    let fake = Fake::new();
    let app = Router::new()
        .route("/health", get(health))
        .route("/session", post(create_session).get(list_sessions))
        .route("/session/{id}", get(get_session))
        .route("/session/{id}/message", post(message))
        .route("/session/{id}/prompt_async", post(prompt_async))
        .route("/session/{id}/abort", post(abort))
        .route("/session/{id}/permissions/{pid}", post(permission))
        .route("/event", get(events))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    }));
    (fake, format!("http://{addr}"))
}

fn backend(url: &str, mode: Mode) -> ServerBackend {
    backend_with(url, mode, |_| {})
}

fn backend_with(url: &str, mode: Mode, tweak: impl FnOnce(&mut ServerSettings)) -> ServerBackend {
    let mut settings = ServerSettings {
        base_url: Some(url.to_string()),
        permission_timeout_ms: 2_000,
        ..ServerSettings::default()
    };
    tweak(&mut settings);
    ServerBackend::new(settings, mode)
}

async fn run(backend: &ServerBackend, request: InvokeRequest) -> (Vec<CanonicalEvent>, Option<BackendSession>) {
    let invocation = backend.invoke(request);
    let events = tokio::time::timeout(Duration::from_secs(10), invocation.events.collect::<Vec<_>>())
        .await
        .unwrap();
    (events, invocation.session.await.ok())
}

// ── tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn probe_reports_server_version() {
    let (_fake, url) = start_fake().await;
    let info = backend(&url, Mode::default()).probe().await.unwrap();
    assert_eq!(info.version.as_deref(), Some("fake-1"));
}

#[tokio::test]
async fn live_events_and_batch_do_not_double_emit() {
    let (_fake, url) = start_fake().await;
    let backend = backend(&url, Mode::default());

    let (events, session) = run(&backend, InvokeRequest::new("hi")).await;
    assert_eq!(
        events,
        vec![
            CanonicalEvent::status(StatusPhase::Starting),
            CanonicalEvent::text_delta("Hel"),
            CanonicalEvent::text_delta("lo"),
            CanonicalEvent::ToolCall {
                name: "list".into(),
                args: json!({"path": "."}),
                call_id: "call_1".into()
            },
            CanonicalEvent::ToolResult {
                name: "list".into(),
                result: json!("a.txt"),
                call_id: "call_1".into()
            },
            CanonicalEvent::TokenUsage {
                turns: 1,
                duration_ms: 300
            },
            CanonicalEvent::status(StatusPhase::Idle),
        ]
    );
    assert_eq!(session, Some(BackendSession::new("ses_1")));
}

#[tokio::test]
async fn prior_session_is_continued_or_replaced() {
    let (fake, url) = start_fake().await;
    let backend = backend(&url, Mode::default());

    let continued = InvokeRequest::new("hi").with_session(Some(BackendSession::new("ses_42")));
    let (_, session) = run(&backend, continued).await;
    assert_eq!(session, Some(BackendSession::new("ses_42")));
    assert_eq!(fake.creates.load(Ordering::SeqCst), 0);

    let stale = InvokeRequest::new("hi").with_session(Some(BackendSession::new("gone")));
    let (events, session) = run(&backend, stale).await;
    assert_eq!(session, Some(BackendSession::new("ses_1")));
    assert_eq!(events.last(), Some(&CanonicalEvent::status(StatusPhase::Idle)));
}

#[tokio::test]
async fn permission_forwarded_and_answered() {
    let (fake, url) = start_fake().await;
    let backend = backend(&url, Mode::default());
    let broker = backend.permission_broker().unwrap();

    let mut events = backend.invoke(InvokeRequest::new("ask")).events;
    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .unwrap()
    {
        if let CanonicalEvent::PermissionRequest { id, reason, .. } = &event {
            assert_eq!(reason, "Run make");
            assert!(broker.resolve(id, PermissionDecision::Once));
        }
        seen.push(event);
    }

    assert_eq!(fake.decisions.lock().clone(), vec![("per_1".to_string(), "once".to_string())]);
    assert!(seen.contains(&CanonicalEvent::full_text("decision: once")));
    assert_eq!(seen.last(), Some(&CanonicalEvent::status(StatusPhase::Idle)));
}

#[tokio::test]
async fn permissive_mode_auto_resolves() {
    let (fake, url) = start_fake().await;
    let backend = backend(&url, Mode::new(PermissionMode::Yolo, None));

    let (events, _) = run(&backend, InvokeRequest::new("ask")).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, CanonicalEvent::PermissionRequest { .. })));
    assert!(events.contains(&CanonicalEvent::full_text("decision: always")));
    assert_eq!(fake.decisions.lock().len(), 1);
}

#[tokio::test]
async fn unanswered_permission_is_denied_after_timeout() {
    let (fake, url) = start_fake().await;
    let backend = backend_with(&url, Mode::default(), |s| s.permission_timeout_ms = 100);

    let (events, _) = run(&backend, InvokeRequest::new("ask")).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, CanonicalEvent::PermissionRequest { .. })));
    assert!(events.contains(&CanonicalEvent::full_text("decision: reject")));
    assert_eq!(fake.decisions.lock()[0].1, "reject");
}

#[tokio::test]
async fn cancel_aborts_remotely_and_stops() {
    let (fake, url) = start_fake().await;
    let backend = Arc::new(backend(&url, Mode::default()));

    let invocation = backend.invoke(InvokeRequest::new("hang"));
    let collector = tokio::spawn(invocation.events.collect::<Vec<_>>());
    let session = tokio::time::timeout(Duration::from_secs(5), invocation.session)
        .await
        .unwrap()
        .unwrap();

    assert!(backend.cancel().await);
    let events = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(events.last(), Some(&CanonicalEvent::status(StatusPhase::Stopped)));
    assert_eq!(fake.aborts.lock().clone(), vec![session.as_str().to_string()]);
    assert!(!backend.cancel().await);
}

#[tokio::test]
async fn session_error_ends_turn() {
    let (_fake, url) = start_fake().await;
    let (events, _) = run(&backend(&url, Mode::default()), InvokeRequest::new("fail")).await;
    assert_eq!(events.last(), Some(&CanonicalEvent::error("bad key")));
}

#[tokio::test]
async fn rejected_prompt_reports_status() {
    let (_fake, url) = start_fake().await;
    let (events, _) = run(&backend(&url, Mode::default()), InvokeRequest::new("broken")).await;
    assert_matches!(
        events.last(),
        Some(CanonicalEvent::Status { phase: StatusPhase::Error, detail: Some(d) }) if d.contains("model not found")
    );
}

#[tokio::test]
async fn feed_disconnect_is_reported() {
    let (_fake, url) = start_fake().await;
    let (events, _) = run(&backend(&url, Mode::default()), InvokeRequest::new("drop")).await;
    assert_matches!(
        events.last(),
        Some(CanonicalEvent::Status { phase: StatusPhase::Error, detail: Some(d) }) if d.contains("disconnected")
    );
}

#[tokio::test]
async fn async_prompt_ends_on_idle() {
    let (_fake, url) = start_fake().await;
    let backend = backend_with(&url, Mode::default(), |s| s.async_prompts = true);
    let (events, _) = run(&backend, InvokeRequest::new("hi")).await;
    assert_eq!(
        events,
        vec![
            CanonicalEvent::status(StatusPhase::Starting),
            CanonicalEvent::text_delta("async"),
            CanonicalEvent::status(StatusPhase::Idle),
        ]
    );
}

#[tokio::test]
async fn session_management() {
    let (_fake, url) = start_fake().await;
    let backend = backend(&url, Mode::default());
    let sessions = backend.list_sessions().await.unwrap();
    assert_eq!(sessions[0].title.as_deref(), Some("first"));
    backend.dispose().await;
    assert!(backend.list_sessions().await.is_err());
}
