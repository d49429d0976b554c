//! Connection lifecycle: the engine actor and its public handle.
//!
//! A single actor task owns all mutable engine state (connection state,
//! session caches, the streaming reconstructor) and processes, in strict
//! order: inbound transport events, public commands, and the reconnect
//! timer. Requests block only their own caller; responses the actor itself
//! must act on are either intercepted on the inbound path (`chat.send`
//! acknowledgments, history loads) or awaited in spawned subtasks that feed
//! results back as commands (handshake outcome, session refresh), so the
//! inbound path never waits on a correlated response.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlator::RequestCorrelator;
use crate::dispatch::{Inbound, classify};
use crate::error::GatewayError;
use crate::handshake::{self, AuthFailure};
use crate::identity::DeviceIdentity;
use crate::protocol::{
    Attachment, ChatSendAck, ChatSendParams, Frame, HelloPayload, HistoryParams, HistoryPayload,
    SessionListPayload, SessionResetPayload, SessionRow, methods,
};
use crate::session::{ChatMessage, Role, SessionState, history_messages};
use crate::stream::{RunEffect, RunStatus, StreamReconstructor};
use crate::transport::{Connector, TransportEvent};

/// Engine connection state. Transitions are the only legal mutation path and
/// only the engine actor performs them; readers snapshot via `watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// The gateway wants this device approved out of band. The engine keeps
    /// retrying on the usual cadence so approval takes effect by itself.
    PairingRequired(String),
    /// Unrecoverable handshake failure; the engine stops retrying.
    Error(String),
}

/// Everything observers can learn about engine activity.
#[derive(Debug, Clone)]
pub enum ClientNotification {
    State(ConnectionState),
    /// Optimistic local user message, appended before server acknowledgment.
    MessageAppended(ChatMessage),
    /// New suffix of the streaming assistant message.
    Chunk { message_id: String, delta: String },
    /// A run ended; the finalized message is already merged into history.
    MessageFinalized {
        message: ChatMessage,
        status: RunStatus,
        error_message: Option<String>,
    },
    HistoryReplaced(Vec<ChatMessage>),
    SessionsUpdated(Vec<SessionRow>),
    UnreadChanged(Vec<String>),
    /// Unrecognized gateway event, forwarded untouched.
    GatewayEvent {
        event: String,
        payload: Option<Value>,
        seq: Option<u64>,
    },
}

/// Point-in-time copy of the actor-owned caches.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub current_session: Option<String>,
    pub sessions: Vec<SessionRow>,
    pub unread_sessions: Vec<String>,
    pub messages: Vec<ChatMessage>,
}

enum Command {
    Connect {
        endpoint: Option<(String, u16)>,
    },
    Disconnect,
    SendChat {
        text: String,
        attachments: Option<Vec<Attachment>>,
        respond_to: oneshot::Sender<Result<String, GatewayError>>,
    },
    SwitchSession {
        key: String,
        respond_to: oneshot::Sender<()>,
    },
    ResetSession {
        respond_to: oneshot::Sender<Result<String, GatewayError>>,
    },
    RefreshSessions {
        respond_to: oneshot::Sender<Result<Vec<SessionRow>, GatewayError>>,
    },
    LoadHistory,
    // Results fed back by spawned subtasks; applied on the command path so
    // the caches stay single-writer.
    ApplySessions {
        rows: Vec<SessionRow>,
    },
    AdoptResetKey {
        key: String,
        respond_to: oneshot::Sender<Result<String, GatewayError>>,
    },
    AuthOutcome {
        result: Result<HelloPayload, GatewayError>,
    },
    Snapshot {
        respond_to: oneshot::Sender<EngineSnapshot>,
    },
}

/// Issue one correlated request over an open channel and await its response.
async fn correlated_request(
    correlator: &RequestCorrelator,
    outbound: &mpsc::Sender<String>,
    method: &str,
    params: Option<Value>,
    deadline: Duration,
) -> Result<Value, GatewayError> {
    let (id, rx) = correlator.register();
    let frame = Frame::Req {
        id: id.clone(),
        method: method.to_string(),
        params,
    };
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(e) => {
            correlator.forget(&id);
            return Err(e.into());
        }
    };
    if outbound.send(text).await.is_err() {
        correlator.forget(&id);
        return Err(GatewayError::ConnectionLost);
    }
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GatewayError::ConnectionLost),
        Err(_) => {
            // Remove the entry so a late response is dropped as unmatched.
            correlator.forget(&id);
            Err(GatewayError::Timeout {
                method: method.to_string(),
            })
        }
    }
}

/// Handle to the engine actor. Cheap to clone; all clones drive the same
/// connection.
#[derive(Clone)]
pub struct GatewayClient {
    config: ClientConfig,
    cmd_tx: mpsc::Sender<Command>,
    notify_tx: broadcast::Sender<ClientNotification>,
    state_rx: watch::Receiver<ConnectionState>,
    outbound: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    correlator: Arc<RequestCorrelator>,
    cancel: CancellationToken,
}

impl GatewayClient {
    /// Spawn the engine actor. `identity` signs the handshake; `connector`
    /// dials the endpoint from `config` (or a later override).
    pub fn new(
        config: ClientConfig,
        identity: Arc<dyn DeviceIdentity>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (notify_tx, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let outbound = Arc::new(RwLock::new(None));
        let correlator = Arc::new(RequestCorrelator::new());
        let cancel = CancellationToken::new();

        let actor = Engine {
            config: config.clone(),
            identity,
            connector,
            correlator: correlator.clone(),
            outbound: outbound.clone(),
            cmd_tx: cmd_tx.clone(),
            notify_tx: notify_tx.clone(),
            state_tx,
            cancel: cancel.clone(),
            endpoint: (config.host.clone(), config.port),
            should_reconnect: false,
            reconnect_at: None,
            inbound: None,
            challenge_nonce: None,
            pending_sends: Vec::new(),
            pending_histories: Vec::new(),
            session: SessionState::new(),
            reconstructor: StreamReconstructor::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            config,
            cmd_tx,
            notify_tx,
            state_rx,
            outbound,
            correlator,
            cancel,
        }
    }

    /// Engine backed by the real WebSocket transport.
    pub fn with_websocket(config: ClientConfig, identity: Arc<dyn DeviceIdentity>) -> Self {
        Self::new(config, identity, Arc::new(crate::transport::ws::WsConnector::new()))
    }

    /// Begin connecting to the configured endpoint and keep reconnecting on
    /// a fixed cadence until [`GatewayClient::disconnect`] is called.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.send_cmd(Command::Connect { endpoint: None }).await
    }

    /// Connect to a different endpoint, tearing down any existing transport.
    pub async fn connect_to(&self, host: impl Into<String>, port: u16) -> Result<(), GatewayError> {
        self.send_cmd(Command::Connect {
            endpoint: Some((host.into(), port)),
        })
        .await
    }

    /// Stop reconnecting, close the transport, and fail all pending
    /// requests. Idempotent.
    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        self.send_cmd(Command::Disconnect).await
    }

    /// Tear the engine down entirely.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch every state transition.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to the notification stream (chunks, history, raw events).
    pub fn subscribe(&self) -> broadcast::Receiver<ClientNotification> {
        self.notify_tx.subscribe()
    }

    /// Issue an arbitrary correlated request. Blocks only this caller.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let outbound = self
            .outbound
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(GatewayError::NotConnected)?;
        correlated_request(
            &self.correlator,
            &outbound,
            method,
            params,
            self.config.request_timeout,
        )
        .await
    }

    /// Send a chat message to the active session. Resolves to the server's
    /// run id once the send is acknowledged.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        attachments: Option<Vec<Attachment>>,
    ) -> Result<String, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::SendChat {
            text: text.into(),
            attachments,
            respond_to: tx,
        })
        .await?;
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectionLost),
            Err(_) => Err(GatewayError::Timeout {
                method: methods::CHAT_SEND.to_string(),
            }),
        }
    }

    /// Make `key` the active session: clears history, clears its unread
    /// mark, and reloads history scoped to it.
    pub async fn switch_session(&self, key: impl Into<String>) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::SwitchSession {
            key: key.into(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| GatewayError::Closed)
    }

    /// Reset the current session on the server; adopts the returned key.
    pub async fn create_session(&self) -> Result<String, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::ResetSession { respond_to: tx }).await?;
        rx.await.map_err(|_| GatewayError::Closed)?
    }

    /// Fetch the session list and replace the cached snapshot wholesale.
    pub async fn refresh_sessions(&self) -> Result<Vec<SessionRow>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::RefreshSessions { respond_to: tx }).await?;
        rx.await.map_err(|_| GatewayError::Closed)?
    }

    /// Re-request history for the active session.
    pub async fn load_history(&self) -> Result<(), GatewayError> {
        self.send_cmd(Command::LoadHistory).await
    }

    /// Snapshot of the actor-owned caches.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::Snapshot { respond_to: tx }).await?;
        rx.await.map_err(|_| GatewayError::Closed)
    }

    async fn send_cmd(&self, cmd: Command) -> Result<(), GatewayError> {
        self.cmd_tx.send(cmd).await.map_err(|_| GatewayError::Closed)
    }
}

/// A `chat.send` awaiting its acknowledgment. Tracked by the actor rather
/// than the generic correlator so run adoption happens on the inbound path,
/// strictly before any `chat` event for the new run.
struct PendingSend {
    request_id: String,
    session_key: String,
    respond_to: oneshot::Sender<Result<String, GatewayError>>,
}

/// A `chat.history` request in flight. Tracked by the actor so the rebuild
/// happens at response arrival, in frame order; `revision` pins the message
/// cache the load was issued against, so a load whose cache has moved on
/// (switch, optimistic append) is discarded instead of clobbering it.
struct PendingHistory {
    request_id: String,
    session_key: String,
    revision: u64,
}

struct Engine {
    config: ClientConfig,
    identity: Arc<dyn DeviceIdentity>,
    connector: Arc<dyn Connector>,
    correlator: Arc<RequestCorrelator>,
    outbound: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    cmd_tx: mpsc::Sender<Command>,
    notify_tx: broadcast::Sender<ClientNotification>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,

    endpoint: (String, u16),
    should_reconnect: bool,
    reconnect_at: Option<Instant>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    challenge_nonce: Option<String>,
    pending_sends: Vec<PendingSend>,
    pending_histories: Vec<PendingHistory>,
    session: SessionState,
    reconstructor: StreamReconstructor,
}

impl Engine {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown();
                    debug!("engine shut down");
                    break;
                }
                event = recv_inbound(&mut self.inbound) => {
                    match event {
                        Some(TransportEvent::Frame(text)) => self.handle_frame(&text),
                        Some(TransportEvent::Closed { reason }) => self.handle_closed(reason),
                        None => self.handle_closed(None),
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            // All handles dropped.
                            self.teardown();
                            break;
                        }
                    }
                }
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    if self.should_reconnect {
                        info!("reconnecting");
                        self.do_connect().await;
                    }
                }
            }
        }
    }

    // --- commands ---

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { endpoint } => {
                if let Some(endpoint) = endpoint {
                    self.endpoint = endpoint;
                }
                self.should_reconnect = true;
                self.reconnect_at = None;
                self.do_connect().await;
            }
            Command::Disconnect => {
                self.should_reconnect = false;
                self.reconnect_at = None;
                self.teardown();
                self.set_state(ConnectionState::Disconnected);
            }
            Command::SendChat {
                text,
                attachments,
                respond_to,
            } => self.handle_send_chat(text, attachments, respond_to).await,
            Command::SwitchSession { key, respond_to } => {
                // A run streaming into the old session must not follow the
                // focus; from here its events are foreign activity.
                self.reconstructor.clear();
                self.session.switch_to(key.clone());
                self.notify(ClientNotification::HistoryReplaced(Vec::new()));
                self.notify(ClientNotification::UnreadChanged(self.session.unread()));
                self.request_history_load(key).await;
                let _ = respond_to.send(());
            }
            Command::ResetSession { respond_to } => self.handle_reset_session(respond_to),
            Command::RefreshSessions { respond_to } => self.handle_refresh_sessions(respond_to),
            Command::LoadHistory => match self.session.current_key().map(str::to_string) {
                Some(key) => self.request_history_load(key).await,
                None => self.notify(ClientNotification::HistoryReplaced(Vec::new())),
            },
            Command::ApplySessions { rows } => {
                self.session.replace_sessions(rows.clone());
                self.notify(ClientNotification::SessionsUpdated(rows));
            }
            Command::AdoptResetKey { key, respond_to } => {
                self.reconstructor.clear();
                self.session.adopt_reset(key.clone());
                self.notify(ClientNotification::HistoryReplaced(Vec::new()));
                self.notify(ClientNotification::UnreadChanged(self.session.unread()));
                let _ = respond_to.send(Ok(key));
            }
            Command::AuthOutcome { result } => self.handle_auth_outcome(result).await,
            Command::Snapshot { respond_to } => {
                let _ = respond_to.send(EngineSnapshot {
                    current_session: self.session.current_key().map(str::to_string),
                    sessions: self.session.sessions().to_vec(),
                    unread_sessions: self.session.unread(),
                    messages: self.session.messages().to_vec(),
                });
            }
        }
    }

    async fn handle_send_chat(
        &mut self,
        text: String,
        attachments: Option<Vec<Attachment>>,
        respond_to: oneshot::Sender<Result<String, GatewayError>>,
    ) {
        self.sweep_abandoned_sends();
        let Some(outbound) = self.current_outbound() else {
            let _ = respond_to.send(Err(GatewayError::NotConnected));
            return;
        };
        let Some(session_key) = self.session.current_key().map(str::to_string) else {
            let _ = respond_to.send(Err(GatewayError::Protocol(
                "no active session".to_string(),
            )));
            return;
        };

        // Optimistic append, before server acknowledgment.
        let local = ChatMessage::user(text.clone());
        self.session.push_message(local.clone());
        self.notify(ClientNotification::MessageAppended(local));

        let params = ChatSendParams {
            session_key: session_key.clone(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            message: text,
            attachments,
        };
        let request_id = self.correlator.allocate_id();
        let frame = Frame::Req {
            id: request_id.clone(),
            method: methods::CHAT_SEND.to_string(),
            params: serde_json::to_value(&params).ok(),
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                let _ = respond_to.send(Err(e.into()));
                return;
            }
        };
        if outbound.send(text).await.is_err() {
            let _ = respond_to.send(Err(GatewayError::ConnectionLost));
            return;
        }
        self.pending_sends.push(PendingSend {
            request_id,
            session_key,
            respond_to,
        });
    }

    fn handle_reset_session(&mut self, respond_to: oneshot::Sender<Result<String, GatewayError>>) {
        let Some(outbound) = self.current_outbound() else {
            let _ = respond_to.send(Err(GatewayError::NotConnected));
            return;
        };
        let Some(current) = self.session.current_key().map(str::to_string) else {
            let _ = respond_to.send(Err(GatewayError::Protocol(
                "no active session".to_string(),
            )));
            return;
        };
        let correlator = self.correlator.clone();
        let cmd_tx = self.cmd_tx.clone();
        let deadline = self.config.request_timeout;
        tokio::spawn(async move {
            let params = serde_json::json!({ "sessionKey": current });
            let result = correlated_request(
                &correlator,
                &outbound,
                methods::SESSION_RESET,
                Some(params),
                deadline,
            )
            .await;
            match result {
                Ok(value) => {
                    let key = serde_json::from_value::<SessionResetPayload>(value)
                        .ok()
                        .and_then(|p| p.key)
                        .unwrap_or(current);
                    let _ = cmd_tx
                        .send(Command::AdoptResetKey { key, respond_to })
                        .await;
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            }
        });
    }

    fn handle_refresh_sessions(
        &mut self,
        respond_to: oneshot::Sender<Result<Vec<SessionRow>, GatewayError>>,
    ) {
        let Some(outbound) = self.current_outbound() else {
            let _ = respond_to.send(Err(GatewayError::NotConnected));
            return;
        };
        let correlator = self.correlator.clone();
        let cmd_tx = self.cmd_tx.clone();
        let deadline = self.config.request_timeout;
        tokio::spawn(async move {
            let result = correlated_request(
                &correlator,
                &outbound,
                methods::SESSION_LIST,
                None,
                deadline,
            )
            .await;
            match result {
                Ok(value) => {
                    let rows = serde_json::from_value::<SessionListPayload>(value)
                        .map(|p| p.sessions)
                        .unwrap_or_default();
                    let _ = cmd_tx
                        .send(Command::ApplySessions { rows: rows.clone() })
                        .await;
                    let _ = respond_to.send(Ok(rows));
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            }
        });
    }

    /// Request history for `key`. The response is intercepted on the inbound
    /// path, in frame order, and applied only if the message cache has not
    /// moved on since the request went out.
    async fn request_history_load(&mut self, key: String) {
        let pending = PendingHistory {
            request_id: self.correlator.allocate_id(),
            session_key: key.clone(),
            revision: self.session.revision(),
        };
        let Some(outbound) = self.current_outbound() else {
            // Still publish an empty history so no stale view survives.
            self.apply_history(pending, Vec::new());
            return;
        };
        let params = HistoryParams {
            session_key: key,
            limit: self.config.history_limit,
        };
        let frame = Frame::Req {
            id: pending.request_id.clone(),
            method: methods::CHAT_HISTORY.to_string(),
            params: serde_json::to_value(&params).ok(),
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            self.apply_history(pending, Vec::new());
            return;
        };
        if outbound.send(text).await.is_err() {
            self.apply_history(pending, Vec::new());
            return;
        }
        self.pending_histories.push(pending);
    }

    /// Rebuild the message list from a settled history load, unless the
    /// cache it was issued against is gone.
    fn apply_history(&mut self, pending: PendingHistory, messages: Vec<ChatMessage>) {
        if self.session.current_key() != Some(pending.session_key.as_str()) {
            debug!(key = %pending.session_key, "discarding history for non-current session");
            return;
        }
        if self.session.revision() != pending.revision {
            // A switch or an optimistic append happened while the load was
            // in flight; replacing now would wipe it.
            debug!(key = %pending.session_key, "discarding history for a cache that moved on");
            return;
        }
        self.session.replace_history(messages.clone());
        self.notify(ClientNotification::HistoryReplaced(messages));
    }

    // --- connection ---

    async fn do_connect(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Connecting);
        let url = {
            let mut config = self.config.clone();
            config.host = self.endpoint.0.clone();
            config.port = self.endpoint.1;
            config.url()
        };
        info!(url = %url, "connecting to gateway");
        match self.connector.connect(&url).await {
            Ok(connection) => {
                *self.outbound.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(connection.outbound);
                self.inbound = Some(connection.inbound);
                self.set_state(ConnectionState::Authenticating);
            }
            Err(e) => {
                warn!(error = %e, "dial failed");
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    /// Close the transport and fail everything still in flight.
    fn teardown(&mut self) {
        *self.outbound.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.inbound = None;
        self.challenge_nonce = None;
        self.correlator.fail_all(GatewayError::ConnectionLost);
        for send in self.pending_sends.drain(..) {
            let _ = send.respond_to.send(Err(GatewayError::ConnectionLost));
        }
        for pending in std::mem::take(&mut self.pending_histories) {
            self.apply_history(pending, Vec::new());
        }
        self.reconstructor.clear();
    }

    fn handle_closed(&mut self, reason: Option<String>) {
        debug!(reason = ?reason, "transport closed");
        self.teardown();
        // A handshake verdict (Error / PairingRequired) outranks the
        // transport close that follows it.
        let state = self.state_tx.borrow().clone();
        if !matches!(
            state,
            ConnectionState::Error(_) | ConnectionState::PairingRequired(_)
        ) {
            self.set_state(ConnectionState::Disconnected);
        }
        if self.should_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.should_reconnect && self.reconnect_at.is_none() {
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
            debug!(delay = ?self.config.reconnect_delay, "reconnect scheduled");
        }
    }

    // --- inbound ---

    fn handle_frame(&mut self, text: &str) {
        match classify(text) {
            None | Some(Inbound::Passive) => {}
            Some(Inbound::Response { id, result }) => self.handle_response(id, result),
            Some(Inbound::Challenge(challenge)) => {
                self.challenge_nonce = Some(challenge.nonce);
                self.begin_handshake();
            }
            Some(Inbound::Chat(payload)) => self.handle_chat_event(payload),
            Some(Inbound::Other {
                event,
                payload,
                seq,
            }) => {
                self.notify(ClientNotification::GatewayEvent {
                    event,
                    payload,
                    seq,
                });
            }
        }
    }

    fn handle_response(&mut self, id: String, result: Result<Value, GatewayError>) {
        self.sweep_abandoned_sends();
        if let Some(pos) = self
            .pending_sends
            .iter()
            .position(|p| p.request_id == id)
        {
            let pending = self.pending_sends.remove(pos);
            self.handle_send_ack(pending, result);
            return;
        }
        if let Some(pos) = self
            .pending_histories
            .iter()
            .position(|p| p.request_id == id)
        {
            let pending = self.pending_histories.remove(pos);
            let messages = match result {
                Ok(value) => serde_json::from_value::<HistoryPayload>(value)
                    .map(history_messages)
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, key = %pending.session_key, "history load failed, publishing empty");
                    Vec::new()
                }
            };
            self.apply_history(pending, messages);
            return;
        }
        if !self.correlator.resolve(&id, result) {
            debug!(id = %id, "dropping unmatched response");
        }
    }

    /// Drop sends whose caller has given up. An acknowledgment arriving for
    /// one of these later is dropped as unmatched instead of adopting a run
    /// nobody is awaiting.
    fn sweep_abandoned_sends(&mut self) {
        self.pending_sends.retain(|p| {
            if p.respond_to.is_closed() {
                debug!(id = %p.request_id, "dropping abandoned chat.send");
                false
            } else {
                true
            }
        });
    }

    /// A `chat.send` acknowledgment, processed on the inbound path so the
    /// run is adopted before any of its `chat` events.
    fn handle_send_ack(&mut self, pending: PendingSend, result: Result<Value, GatewayError>) {
        match result {
            Ok(value) => {
                let run_id = serde_json::from_value::<ChatSendAck>(value)
                    .ok()
                    .and_then(|ack| ack.run_id);
                let Some(run_id) = run_id else {
                    let _ = pending.respond_to.send(Err(GatewayError::Protocol(
                        "chat.send response missing runId".to_string(),
                    )));
                    return;
                };
                if pending.respond_to.is_closed() {
                    // Caller already timed out; a late acknowledgment must
                    // not resurrect the run.
                    debug!(run = %run_id, "dropping late chat.send acknowledgment");
                    return;
                }
                self.reconstructor
                    .begin(run_id.clone(), pending.session_key);
                let _ = pending.respond_to.send(Ok(run_id));
            }
            Err(e) => {
                let _ = pending.respond_to.send(Err(e));
            }
        }
    }

    fn handle_chat_event(&mut self, payload: crate::protocol::ChatEventPayload) {
        let effects = self
            .reconstructor
            .apply(&payload, self.session.current_key());
        for effect in effects {
            match effect {
                RunEffect::Chunk { message_id, delta } => {
                    self.notify(ClientNotification::Chunk { message_id, delta });
                }
                RunEffect::Finalized {
                    message_id,
                    text,
                    status,
                    error_message,
                } => {
                    let message = ChatMessage {
                        id: message_id,
                        role: Role::Assistant,
                        content: text,
                        timestamp: chrono::Utc::now(),
                    };
                    self.session.upsert_message(message.clone());
                    self.notify(ClientNotification::MessageFinalized {
                        message,
                        status,
                        error_message,
                    });
                }
                RunEffect::Unread { session_key } => {
                    if self.session.mark_unread(&session_key) {
                        self.notify(ClientNotification::UnreadChanged(self.session.unread()));
                    }
                }
            }
        }
    }

    // --- handshake ---

    fn begin_handshake(&mut self) {
        let Some(nonce) = self.challenge_nonce.take() else {
            // Local programming error: never send an unsigned connect.
            self.should_reconnect = false;
            self.teardown();
            self.set_state(ConnectionState::Error(
                "handshake attempted without a challenge nonce".to_string(),
            ));
            return;
        };
        let Some(outbound) = self.current_outbound() else {
            debug!("challenge arrived with no open transport");
            return;
        };

        let params = handshake::build_connect_params(&self.config, self.identity.as_ref(), &nonce);
        let correlator = self.correlator.clone();
        let cmd_tx = self.cmd_tx.clone();
        let deadline = self.config.request_timeout;
        tokio::spawn(async move {
            let result = correlated_request(
                &correlator,
                &outbound,
                methods::CONNECT,
                serde_json::to_value(&params).ok(),
                deadline,
            )
            .await
            .and_then(|value| {
                serde_json::from_value::<HelloPayload>(value)
                    .map_err(|e| GatewayError::Protocol(format!("bad connect payload: {e}")))
            });
            let _ = cmd_tx.send(Command::AuthOutcome { result }).await;
        });
    }

    async fn handle_auth_outcome(&mut self, result: Result<HelloPayload, GatewayError>) {
        match result {
            Ok(hello) => {
                if let Some(token) = hello.device_token {
                    self.identity.store_device_token(token);
                }
                if let Some(key) = hello
                    .snapshot
                    .and_then(|s| s.session_defaults)
                    .and_then(|d| d.main_session_key)
                {
                    self.session.adopt_default(key);
                }
                info!("authenticated");
                self.set_state(ConnectionState::Connected);
                match self.session.current_key().map(str::to_string) {
                    Some(key) => self.request_history_load(key).await,
                    None => debug!("no default session key, skipping history load"),
                }
            }
            Err(GatewayError::Rpc(shape)) => match handshake::classify_failure(Some(&shape)) {
                AuthFailure::PairingRequired(message) => {
                    info!("pairing required, retrying until approved");
                    self.teardown();
                    self.set_state(ConnectionState::PairingRequired(message));
                    self.schedule_reconnect();
                }
                AuthFailure::Fatal(message) => {
                    warn!(message = %message, "handshake rejected");
                    self.should_reconnect = false;
                    self.teardown();
                    self.set_state(ConnectionState::Error(message));
                }
            },
            Err(e) => {
                // Timeout or transport loss mid-handshake: recoverable.
                warn!(error = %e, "handshake did not complete");
                self.teardown();
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    // --- helpers ---

    fn current_outbound(&self) -> Option<mpsc::Sender<String>> {
        self.outbound
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&mut self, state: ConnectionState) {
        let changed = {
            let current = self.state_tx.borrow();
            *current != state
        };
        if changed {
            debug!(state = ?state, "state transition");
            let _ = self.state_tx.send(state.clone());
            self.notify(ClientNotification::State(state));
        }
    }

    fn notify(&self, notification: ClientNotification) {
        // No receivers is fine; observers subscribe when they care.
        let _ = self.notify_tx.send(notification);
    }
}

async fn recv_inbound(
    inbound: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
