//! # Server-Stream Backend
//!
//! Talks to a long-lived agent server over HTTP. The server is started once
//! (or attached to, when a base URL is configured) and a single `/event`
//! subscription is relayed onto a broadcast feed that every invocation
//! reads from.
//!
//! Each invocation:
//! 1. continues the prior session (a 404 falls back to a new one) or
//!    creates one
//! 2. subscribes to the feed before posting, so no event is missed
//! 3. posts the prompt, synchronously by default
//! 4. translates live feed events for its session as they arrive
//! 5. ends on the prompt response (sync) or `session.idle` (async), or on
//!    `session.error`, a feed disconnect, or cancellation
//!
//! Permission requests are auto-resolved when the invocation's mode allows
//! it, otherwise forwarded upstream and parked in the [`PermissionBroker`].

pub mod client;
pub mod launcher;
pub mod sse;
pub mod translator;
pub mod types;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tether_core::{CanonicalEvent, Mode, PermissionMode, StatusPhase};
use tether_settings::ServerSettings;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    ActiveGuard, ActiveSlot, AgentBackend, BackendInfo, BackendKind, BackendSession, Invocation,
    InvokeRequest, ModeCell, claim_active,
};
use crate::errors::{BackendError, BackendResult};
use crate::permissions::{PermissionBroker, PermissionDecision};

use self::client::ServerClient;
use self::launcher::ServerProcess;
use self::translator::{PermissionAsk, ServerTranslator, SessionSignal};
use self::types::{MessageResponse, PromptBody, ServerEvent, SessionInfo};

/// Events buffered per feed reader before it lags.
const FEED_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
enum FeedItem {
    Event(Arc<ServerEvent>),
    Disconnected(String),
}

struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Runtime {
    process: Option<ServerProcess>,
    subscription: Option<Subscription>,
    version: Option<String>,
}

struct Inner {
    settings: ServerSettings,
    http: reqwest::Client,
    mode: ModeCell,
    broker: Arc<PermissionBroker>,
    client: Mutex<Option<Arc<ServerClient>>>,
    runtime: tokio::sync::Mutex<Runtime>,
    feed: broadcast::Sender<FeedItem>,
    active: ActiveSlot,
    next_id: AtomicU64,
    raw_events: AtomicBool,
    disposed: AtomicBool,
}

/// Agent driven through a local HTTP server with an SSE feed.
pub struct ServerBackend {
    inner: Arc<Inner>,
}

impl ServerBackend {
    /// Backend using `settings`, starting from `defaults`. Nothing is
    /// started until the first probe or invocation.
    pub fn new(settings: ServerSettings, defaults: Mode) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings,
                http: reqwest::Client::new(),
                mode: ModeCell::new(defaults),
                broker: Arc::new(PermissionBroker::new()),
                client: Mutex::new(None),
                runtime: tokio::sync::Mutex::new(Runtime::default()),
                feed,
                active: Arc::new(Mutex::new(None)),
                next_id: AtomicU64::new(0),
                raw_events: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Log every raw feed event at `trace`.
    #[must_use]
    pub fn with_raw_events(self, enabled: bool) -> Self {
        self.inner.raw_events.store(enabled, Ordering::Relaxed);
        self
    }

    /// Server base URL.
    pub fn base_url(&self) -> String {
        self.inner.settings.resolved_base_url()
    }

    /// Mode the next invocation will use.
    pub fn current_mode(&self) -> Mode {
        self.inner.mode.snapshot()
    }

    /// Sessions known to the server.
    pub async fn list_sessions(&self) -> BackendResult<Vec<SessionInfo>> {
        self.inner.ensure_started().await?.list_sessions().await
    }

    /// Delete a server session.
    pub async fn delete_session(&self, id: &str) -> BackendResult<()> {
        self.inner.ensure_started().await?.delete_session(id).await
    }
}

impl Inner {
    /// Start or attach to the server and make sure the feed is relayed.
    async fn ensure_started(&self) -> BackendResult<Arc<ServerClient>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BackendError::unavailable("backend has been disposed"));
        }
        let mut runtime = self.runtime.lock().await;

        let existing = self.client.lock().clone();
        let client = if let Some(client) = existing {
            client
        } else {
            let client = Arc::new(ServerClient::new(
                self.http.clone(),
                self.settings.resolved_base_url(),
                Duration::from_millis(self.settings.request_timeout_ms),
            ));
            if self.settings.base_url.is_some() {
                runtime.version = launcher::attach(&self.settings, &client).await?;
            } else {
                runtime.process = Some(launcher::launch(&self.settings, &client).await?);
                runtime.version = client
                    .health(&self.settings.health_path)
                    .await
                    .ok()
                    .flatten();
            }
            *self.client.lock() = Some(Arc::clone(&client));
            client
        };

        let relaying = runtime
            .subscription
            .as_ref()
            .is_some_and(|sub| !sub.task.is_finished());
        if !relaying {
            let events = client.subscribe().await?;
            let cancel = CancellationToken::new();
            let task = tokio::spawn(relay_events(
                events,
                self.feed.clone(),
                cancel.clone(),
                self.raw_events.load(Ordering::Relaxed),
            ));
            runtime.subscription = Some(Subscription { cancel, task });
            debug!(url = client.base_url(), "subscribed to server events");
        }
        Ok(client)
    }

    /// Answer or forward a permission request. Returns the event to
    /// forward, if the mode requires confirmation.
    fn handle_permission(
        &self,
        client: &Arc<ServerClient>,
        session_id: &str,
        mode: &Mode,
        ask: PermissionAsk,
    ) -> Option<CanonicalEvent> {
        let client = Arc::clone(client);
        let session_id = session_id.to_string();

        if let Some(decision) = PermissionDecision::automatic_for(mode.permission_mode) {
            info!(
                permission_id = %ask.id,
                decision = decision.as_str(),
                "auto-resolving permission request"
            );
            drop(tokio::spawn(async move {
                respond(&client, &session_id, &ask.id, decision).await;
            }));
            return None;
        }

        let event = ask.to_event();
        let rx = self.broker.register(&ask.id);
        let broker = Arc::clone(&self.broker);
        let timeout = Duration::from_millis(self.settings.permission_timeout_ms);
        info!(permission_id = %ask.id, reason = %ask.reason, "forwarding permission request");
        drop(tokio::spawn(async move {
            let decision = broker.wait(&ask.id, rx, timeout).await;
            respond(&client, &session_id, &ask.id, decision).await;
        }));
        Some(event)
    }
}

async fn respond(client: &ServerClient, session_id: &str, permission_id: &str, decision: PermissionDecision) {
    if let Err(e) = client
        .respond_permission(session_id, permission_id, decision)
        .await
    {
        warn!(
            error = %e,
            permission_id,
            decision = decision.as_str(),
            "failed to answer permission request"
        );
    }
}

async fn relay_events<S>(
    events: S,
    feed: broadcast::Sender<FeedItem>,
    cancel: CancellationToken,
    raw: bool,
) where
    S: Stream<Item = ServerEvent> + Send,
{
    let mut events = std::pin::pin!(events);
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = events.next() => next,
        };
        if let Some(event) = next {
            if raw {
                trace!(kind = %event.kind, properties = %event.properties, "raw server event");
            }
            let _ = feed.send(FeedItem::Event(Arc::new(event)));
        } else {
            warn!("server event stream ended");
            let _ = feed.send(FeedItem::Disconnected(
                "server closed the event stream".to_string(),
            ));
            return;
        }
    }
}

/// Continue `prior` when the server still has it, otherwise start fresh.
async fn resolve_session(client: &ServerClient, prior: Option<&BackendSession>) -> BackendResult<String> {
    if let Some(prior) = prior {
        match client.get_session(prior.as_str()).await {
            Ok(session) => return Ok(session.id),
            Err(e) if e.is_not_found() => {
                warn!(
                    session_id = prior.as_str(),
                    "stored session no longer exists, starting a new one"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(client.create_session(None).await?.id)
}

async fn join_response(
    task: &mut Option<JoinHandle<BackendResult<MessageResponse>>>,
) -> Result<BackendResult<MessageResponse>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl AgentBackend for ServerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ServerStream
    }

    async fn probe(&self) -> BackendResult<BackendInfo> {
        let _ = self.inner.ensure_started().await?;
        let version = self.inner.runtime.lock().await.version.clone();
        info!(
            url = %self.base_url(),
            version = version.as_deref().unwrap_or("unknown"),
            "agent server available"
        );
        Ok(BackendInfo {
            kind: BackendKind::ServerStream,
            version,
        })
    }

    fn invoke(&self, request: InvokeRequest) -> Invocation {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Invocation::failed("backend has been disposed");
        }

        let mode = self.inner.mode.snapshot();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let guard = claim_active(&self.inner.active, id, cancel.clone());
        debug!(
            invocation = id,
            permission_mode = %mode.permission_mode,
            model = mode.model.as_deref().unwrap_or("default"),
            resume = request.session.is_some(),
            "invoking agent server"
        );

        let (session_tx, session_rx) = oneshot::channel();
        let events = run_turn(TurnRun {
            inner: Arc::clone(&self.inner),
            mode,
            request,
            cancel,
            guard,
            session_tx,
        });
        Invocation::new(Box::pin(events), session_rx)
    }

    async fn cancel(&self) -> bool {
        let Some(active) = self.inner.active.lock().take() else {
            debug!("cancel requested with no active invocation");
            return false;
        };
        info!(invocation = active.id, "cancelling server turn");
        active.cancel.cancel();
        self.inner.broker.clear();

        let client = self.inner.client.lock().clone();
        if let (Some(client), Some(session_id)) = (client, active.remote.as_deref()) {
            if let Err(e) = client.abort(session_id).await {
                warn!(error = %e, session_id, "abort request failed");
            }
        }
        true
    }

    fn set_model(&self, model: Option<String>) {
        self.inner.mode.set_model(model);
    }

    fn set_permission_mode(&self, mode: PermissionMode) {
        self.inner.mode.set_permission_mode(mode);
    }

    async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(active) = self.inner.active.lock().take() {
            active.cancel.cancel();
        }
        self.inner.broker.clear();

        let mut runtime = self.inner.runtime.lock().await;
        if let Some(subscription) = runtime.subscription.take() {
            subscription.cancel.cancel();
            subscription.task.abort();
        }
        if let Some(process) = runtime.process.take() {
            process.shutdown().await;
        }
        *self.inner.client.lock() = None;
        debug!("server-stream backend disposed");
    }

    fn permission_broker(&self) -> Option<Arc<PermissionBroker>> {
        Some(Arc::clone(&self.inner.broker))
    }
}

struct TurnRun {
    inner: Arc<Inner>,
    mode: Mode,
    request: InvokeRequest,
    cancel: CancellationToken,
    guard: ActiveGuard,
    session_tx: oneshot::Sender<BackendSession>,
}

enum Step {
    Cancelled,
    Feed(Result<FeedItem, RecvError>),
    Response(Result<BackendResult<MessageResponse>, JoinError>),
}

fn run_turn(run: TurnRun) -> impl Stream<Item = CanonicalEvent> + Send + 'static {
    async_stream::stream! {
        let TurnRun { inner, mode, request, cancel, guard, session_tx } = run;

        yield CanonicalEvent::status(StatusPhase::Starting);

        let started = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            started = inner.ensure_started() => Some(started),
        };
        let client = match started {
            Some(Ok(client)) => client,
            Some(Err(err)) => {
                warn!(error = %err, category = err.category(), "agent server unavailable");
                yield CanonicalEvent::error(err.to_string());
                return;
            }
            None => {
                yield CanonicalEvent::status(StatusPhase::Stopped);
                return;
            }
        };
        let mut feed = inner.feed.subscribe();

        let session_id = match resolve_session(&client, request.session.as_ref()).await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "failed to open server session");
                yield CanonicalEvent::error(format!("failed to open session: {err}"));
                return;
            }
        };
        guard.set_remote(&session_id);
        let _ = session_tx.send(BackendSession::new(session_id.clone()));

        let body = PromptBody::new(&request.prompt, &mode, &inner.settings.default_provider);
        let mut response_task = if inner.settings.async_prompts {
            if let Err(err) = client.send_message_async(&session_id, &body).await {
                warn!(error = %err, "prompt rejected");
                yield CanonicalEvent::error(err.to_string());
                return;
            }
            None
        } else {
            let client = Arc::clone(&client);
            let session_id = session_id.clone();
            Some(tokio::spawn(async move { client.send_message(&session_id, &body).await }))
        };
        let mut translator = ServerTranslator::new(session_id.clone());

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                item = feed.recv() => Step::Feed(item),
                joined = join_response(&mut response_task) => Step::Response(joined),
            };

            let terminal = match step {
                Step::Cancelled => {
                    info!(session_id = %session_id, "server turn stopped");
                    CanonicalEvent::status(StatusPhase::Stopped)
                }
                Step::Feed(Ok(FeedItem::Event(event))) => {
                    let translated = translator.translate_event(&event);
                    for event in translated.events {
                        yield event;
                    }
                    match translated.signal {
                        Some(SessionSignal::Permission(ask)) => {
                            if let Some(event) = inner.handle_permission(&client, &session_id, &mode, ask) {
                                yield event;
                            }
                            continue;
                        }
                        Some(SessionSignal::Idle) if response_task.is_none() => {
                            CanonicalEvent::status(StatusPhase::Idle)
                        }
                        Some(SessionSignal::Idle) => {
                            debug!("session idle before the prompt response arrived");
                            continue;
                        }
                        Some(SessionSignal::Error(message)) => {
                            warn!(error = %message, "agent session failed");
                            CanonicalEvent::error(message)
                        }
                        None => continue,
                    }
                }
                Step::Feed(Ok(FeedItem::Disconnected(reason))) => {
                    warn!(reason = %reason, "event feed disconnected mid-turn");
                    CanonicalEvent::error(format!("event stream disconnected: {reason}"))
                }
                Step::Feed(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "event feed lagged, events dropped");
                    continue;
                }
                Step::Feed(Err(RecvError::Closed)) => CanonicalEvent::error("event feed closed"),
                Step::Response(joined) => {
                    response_task = None;
                    match joined {
                        Ok(Ok(response)) => {
                            let batch = translator.translate_response(&response);
                            for event in batch.events {
                                yield event;
                            }
                            match batch.error {
                                Some(message) => {
                                    warn!(error = %message, "assistant message ended with an error");
                                    CanonicalEvent::error(message)
                                }
                                None => CanonicalEvent::status(StatusPhase::Idle),
                            }
                        }
                        Ok(Err(err)) => {
                            warn!(error = %err, category = err.category(), "prompt request failed");
                            CanonicalEvent::error(err.to_string())
                        }
                        Err(err) => CanonicalEvent::error(format!("prompt request task failed: {err}")),
                    }
                }
            };

            if let Some(task) = response_task.take() {
                task.abort();
            }
            yield terminal;
            return;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
