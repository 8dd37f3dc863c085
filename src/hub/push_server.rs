//! C4 — Push Server: the WebSocket transport that turns the dispatch
//! fabric's envelopes and lifecycle events into frames on the wire, and
//! turns client frames into calls on the delivery engine, registry, and
//! event bus.
//!
//! Grounded on the accept-loop/split-socket pattern used for WebSocket
//! transports elsewhere in this codebase: `socket.split()` into a sink and
//! a stream, an mpsc channel bridging engine-originated frames into the
//! sink, and a `tokio::select!` loop pumping both sides.

use crate::domain_types::AgentId;
use crate::hub::domain_types::{
    AckKind, InstanceId, MessageId, Priority, SendOptions, SendTarget, SessionId, Timestamp,
};
use crate::hub::delivery::DeliveryEngineImpl;
use crate::hub::traits::{DeliveryEngine, DispatchFabric, InstanceRegistry};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::hub::registry::InstanceRegistryImpl;
use crate::hub::session::SessionTable;

/// Frames the server sends to a connected client.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    /// Sent immediately after the socket is accepted, before `register`.
    ConnectionWelcome {
        /// The session id assigned to this connection.
        session_id: SessionId,
        /// Server-supported feature flags, forwarded verbatim from config.
        features: Vec<String>,
    },
    /// Acknowledges a successful `register` frame.
    RegistrationSuccess {
        /// The agent id that was registered.
        agent_id: AgentId,
        /// The instance id that was registered.
        instance_id: InstanceId,
    },
    /// Acknowledges a `send_message` frame, with the id assigned to it and
    /// its immediate queued/rejected status.
    MessageSent {
        /// The id assigned to the new tracked message.
        message_id: MessageId,
        /// `"queued"` on success.
        status: String,
    },
    /// Delivers message content to a recipient instance.
    MessageReceived {
        /// The id of the delivered message.
        message_id: MessageId,
        /// The sending agent.
        from: AgentId,
        /// Opaque payload.
        content: Value,
        /// Sender-assigned priority.
        priority: Priority,
        /// Free-form metadata.
        metadata: Value,
        /// Whether the recipient must send a delivery ack.
        requires_ack: bool,
        /// Whether the recipient must send a read receipt.
        requires_read_receipt: bool,
    },
    /// Answers a `heartbeat` frame.
    HeartbeatAck,
    /// A lifecycle event this session is subscribed to.
    Lifecycle {
        /// The event topic, used verbatim as the frame's `type`.
        topic: String,
        /// Event payload.
        payload: Value,
    },
    /// Answers a `get_status` frame.
    Status {
        /// Opaque status payload (a message snapshot or an instance list).
        payload: Value,
    },
    /// A malformed frame or a rejected operation.
    Error {
        /// Human-readable error description.
        message: String,
    },
}

impl ServerFrame {
    /// Serializes this frame to its wire JSON shape. Lifecycle events use
    /// their topic as the `type` discriminant directly, so this is a custom
    /// serializer rather than a derived one.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::ConnectionWelcome {
                session_id,
                features,
            } => json!({
                "type": "connection.welcome",
                "sessionId": session_id,
                "features": features,
            }),
            Self::RegistrationSuccess {
                agent_id,
                instance_id,
            } => json!({
                "type": "registration.success",
                "agentId": agent_id,
                "instanceId": instance_id,
            }),
            Self::MessageSent { message_id, status } => json!({
                "type": "message.sent",
                "messageId": message_id,
                "status": status,
            }),
            Self::MessageReceived {
                message_id,
                from,
                content,
                priority,
                metadata,
                requires_ack,
                requires_read_receipt,
            } => json!({
                "type": "message.received",
                "messageId": message_id,
                "from": from,
                "content": content,
                "priority": priority,
                "metadata": metadata,
                "requiresAck": requires_ack,
                "requiresReadReceipt": requires_read_receipt,
            }),
            Self::HeartbeatAck => json!({ "type": "heartbeat.ack" }),
            Self::Lifecycle { topic, payload } => {
                let mut frame = json!({ "type": topic });
                if let (Some(obj), Some(extra)) = (frame.as_object_mut(), payload.as_object()) {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                frame
            }
            Self::Status { payload } => json!({
                "type": "status",
                "status": payload,
            }),
            Self::Error { message } => json!({
                "type": "error",
                "message": message,
            }),
        }
    }
}

/// Either a single recipient or an explicit list, as written on the wire.
/// A bare `"*"` string means broadcast; this is handled by the
/// `send_message` handler, not at the `serde` layer, since it's a sentinel
/// value rather than a distinct shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToSpec {
    /// Multiple named recipients (A2MA).
    Many(Vec<String>),
    /// A single recipient, or the `"*"` broadcast sentinel.
    Single(String),
}

/// Frames a client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Registers this connection as an instance of `agent_id`.
    Register {
        /// The agent id to register as.
        agent_id: String,
        /// The instance id; a fresh one is assigned if omitted.
        #[serde(default)]
        instance_id: Option<String>,
        /// Capabilities to report for this instance.
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Subscribes this session to lifecycle events for the named agents.
    Subscribe {
        /// Agent ids to subscribe to.
        target_agents: Vec<String>,
    },
    /// Unsubscribes this session from one agent's lifecycle events.
    Unsubscribe {
        /// The agent id to unsubscribe from.
        target_agent_id: String,
    },
    /// Sends a message.
    SendMessage {
        /// The recipient(s), or `"*"` for broadcast.
        to: ToSpec,
        /// Opaque payload.
        content: Value,
        /// Delivery priority; defaults to medium.
        #[serde(default)]
        priority: Option<Priority>,
        /// Whether a delivery ack is required; defaults to true.
        #[serde(default)]
        requires_ack: Option<bool>,
        /// Whether a read receipt is required; defaults to mirror
        /// `requires_ack`.
        #[serde(default)]
        requires_read_receipt: Option<bool>,
        /// Free-form metadata.
        #[serde(default)]
        metadata: Option<Value>,
    },
    /// Acknowledges delivery of a message.
    Acknowledge {
        /// The message being acknowledged.
        message_id: MessageId,
    },
    /// Reports that a message was read by the receiving agent logic.
    ReadReceipt {
        /// The message being acknowledged.
        message_id: MessageId,
    },
    /// Keeps the session alive and refreshes `lastHeartbeat`.
    Heartbeat,
    /// Requests status for a message or the calling agent's instances.
    GetStatus {
        /// A specific message to query.
        #[serde(default)]
        message_id: Option<MessageId>,
        /// An agent id to list live instances for.
        #[serde(default)]
        agent_id: Option<String>,
    },
}

impl ToSpec {
    fn agent_ids(&self) -> Result<Vec<AgentId>, String> {
        let raw: Vec<String> = match self {
            Self::Many(ids) => ids.clone(),
            Self::Single(id) => vec![id.clone()],
        };
        raw.into_iter()
            .map(|id| AgentId::try_new(id).map_err(|e| e.to_string()))
            .collect()
    }
}

/// Shared state the push server's handlers close over.
pub struct PushServerState {
    registry: Arc<InstanceRegistryImpl>,
    engine: Arc<DeliveryEngineImpl>,
    dispatch: Arc<dyn DispatchFabric>,
    sessions: SessionTable,
    heartbeat_timeout: Duration,
    shutdown: CancellationToken,
}

impl PushServerState {
    /// Builds the shared state the WebSocket and HTTP handlers operate on.
    /// The event bus is not held directly: the dispatch fabric already
    /// bridges it to subscribed sessions via `emit_event`. `shutdown` is the
    /// facade's own cancellation token, shared so the heartbeat sweeper and
    /// the facade's `stop()` agree on one shutdown signal.
    #[must_use]
    pub fn new(
        registry: Arc<InstanceRegistryImpl>,
        engine: Arc<DeliveryEngineImpl>,
        dispatch: Arc<dyn DispatchFabric>,
        sessions: SessionTable,
        heartbeat_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            dispatch,
            sessions,
            heartbeat_timeout,
            shutdown,
        })
    }

    /// Builds the axum router exposing `/ws`, `/health`, and `/stats`.
    #[must_use]
    pub fn router(state: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .with_state(state)
    }

    /// Spawns the background task that evicts sessions whose last heartbeat
    /// is older than `heartbeat_timeout`. Returns its `JoinHandle` so the
    /// facade's `stop()` can await it before returning. Polls at a quarter
    /// of `heartbeat_timeout` (floored at 50ms) so the eviction latency
    /// scales with the configured timeout instead of a fixed cadence.
    pub fn spawn_heartbeat_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let tick = (state.heartbeat_timeout / 4).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.sweep_dead_sessions().await;
                    }
                    () = state.shutdown.cancelled() => return,
                }
            }
        })
    }

    async fn sweep_dead_sessions(&self) {
        for (agent_id, instance_id, entry) in self.sessions.heartbeat_snapshot() {
            let last_heartbeat = *entry.last_heartbeat.lock().await;
            if last_heartbeat.elapsed() > self.heartbeat_timeout {
                warn!(%agent_id, %instance_id, "evicting session, heartbeat timed out");
                self.close_and_notify(agent_id, instance_id).await;
            }
        }
    }

    /// Removes a session, cancels its close token so `handle_socket` exits
    /// and the socket is dropped, marks the instance offline, and emits
    /// `agent.offline` — but only if this call actually removed the entry.
    /// `DashMap::remove` only succeeds for one caller, so whichever of the
    /// heartbeat sweeper or the socket's own natural close path gets there
    /// first is the only one that notifies, keeping `agent.offline` exactly
    /// once even though both paths can race to close the same session.
    async fn close_and_notify(&self, agent_id: AgentId, instance_id: InstanceId) {
        let Some(entry) = self.sessions.remove(agent_id.clone(), instance_id.clone()) else {
            return;
        };
        entry.closed.cancel();
        self.registry
            .mark_offline(agent_id.clone(), instance_id)
            .await;
        self.dispatch
            .emit_event(crate::hub::domain_types::LifecycleEvent {
                topic: "agent.offline".to_string(),
                relevant_agents: HashSet::new(),
                payload: json!({ "agentId": agent_id.to_string() }),
            })
            .await;
    }

    /// Closes every currently connected session, as part of facade
    /// shutdown: cancels each close token (so its `handle_socket` task
    /// exits and the socket is dropped), marks every instance offline, and
    /// emits `agent.offline` for each.
    pub async fn close_all_sessions(&self) {
        for (agent_id, instance_id, _) in self.sessions.heartbeat_snapshot() {
            self.close_and_notify(agent_id, instance_id).await;
        }
    }
}

async fn health_handler(State(state): State<Arc<PushServerState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connectedSessions": state.sessions.len(),
    }))
}

async fn stats_handler(State(state): State<Arc<PushServerState>>) -> impl IntoResponse {
    let instances = state.registry.snapshot();
    Json(json!({
        "connectedSessions": state.sessions.len(),
        "pendingMessages": state.engine.all_pending().await.len(),
        "instances": instances,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<PushServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[instrument(skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: Arc<PushServerState>) {
    let session_id = SessionId::generate();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let welcome = ServerFrame::ConnectionWelcome {
        session_id,
        features: vec!["ack".to_string(), "broadcast".to_string()],
    };
    if ws_tx
        .send(Message::Text(welcome.to_json().to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut registered: Option<(AgentId, InstanceId)> = None;
    let mut close_token: Option<CancellationToken> = None;

    loop {
        tokio::select! {
            outgoing = frame_rx.recv() => {
                let Some(frame) = outgoing else { break };
                if ws_tx.send(Message::Text(frame.to_json().to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else { break };
                let Ok(incoming) = incoming else { break };
                match incoming {
                    Message::Text(text) => {
                        let reply = handle_client_frame(
                            &state,
                            &text,
                            session_id,
                            &frame_tx,
                            &mut registered,
                            &mut close_token,
                        )
                        .await;
                        if let Some(reply) = reply {
                            if ws_tx.send(Message::Text(reply.to_json().to_string().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            () = cancelled_or_pending(&close_token) => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if let Some((agent_id, instance_id)) = registered {
        state.close_and_notify(agent_id, instance_id).await;
    }
}

/// Awaits `token`'s cancellation if present, otherwise never resolves — lets
/// `handle_socket`'s `tokio::select!` race an optional close signal before a
/// session is registered (and therefore has no close token yet).
async fn cancelled_or_pending(token: &Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn handle_client_frame(
    state: &Arc<PushServerState>,
    text: &str,
    session_id: SessionId,
    frame_tx: &mpsc::UnboundedSender<ServerFrame>,
    registered: &mut Option<(AgentId, InstanceId)>,
    close_token: &mut Option<CancellationToken>,
) -> Option<ServerFrame> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            return Some(ServerFrame::Error {
                message: format!("malformed frame: {err}"),
            });
        }
    };

    match frame {
        ClientFrame::Register {
            agent_id,
            instance_id,
            capabilities,
        } => {
            let agent_id = match AgentId::try_new(agent_id) {
                Ok(id) => id,
                Err(err) => return Some(ServerFrame::Error { message: err.to_string() }),
            };
            let instance_id = match instance_id {
                Some(id) => match InstanceId::try_new(id) {
                    Ok(id) => id,
                    Err(err) => return Some(ServerFrame::Error { message: err.to_string() }),
                },
                None => InstanceId::try_new(uuid::Uuid::new_v4().to_string())
                    .unwrap_or_else(|_| unreachable!("a UUID string always validates")),
            };

            *close_token = Some(state.sessions.insert(
                agent_id.clone(),
                instance_id.clone(),
                session_id,
                capabilities.iter().cloned().collect(),
                frame_tx.clone(),
            ));
            state
                .registry
                .register(
                    agent_id.clone(),
                    instance_id.clone(),
                    capabilities.into_iter().collect(),
                    Some(session_id),
                )
                .await;
            state
                .dispatch
                .emit_event(crate::hub::domain_types::LifecycleEvent {
                    topic: "agent.online".to_string(),
                    relevant_agents: HashSet::new(),
                    payload: json!({ "agentId": agent_id.to_string() }),
                })
                .await;

            info!(%agent_id, %instance_id, "instance registered");
            *registered = Some((agent_id.clone(), instance_id.clone()));
            Some(ServerFrame::RegistrationSuccess {
                agent_id,
                instance_id,
            })
        }
        ClientFrame::Subscribe { target_agents } => {
            let Some((agent_id, instance_id)) = registered.clone() else {
                return Some(ServerFrame::Error {
                    message: "must register before subscribing".to_string(),
                });
            };
            if let Some(entry) = state.sessions.get(&agent_id, &instance_id) {
                let mut subscriptions = entry.subscriptions.lock().await;
                for raw in target_agents {
                    if let Ok(id) = AgentId::try_new(raw) {
                        subscriptions.insert(id);
                    }
                }
            }
            None
        }
        ClientFrame::Unsubscribe { target_agent_id } => {
            if let Some((agent_id, instance_id)) = registered.clone() {
                if let Some(entry) = state.sessions.get(&agent_id, &instance_id) {
                    if let Ok(target) = AgentId::try_new(target_agent_id) {
                        entry.subscriptions.lock().await.remove(&target);
                    }
                }
            }
            None
        }
        ClientFrame::SendMessage {
            to,
            content,
            priority,
            requires_ack,
            requires_read_receipt,
            metadata,
        } => {
            let Some((from, _)) = registered.clone() else {
                return Some(ServerFrame::Error {
                    message: "must register before sending".to_string(),
                });
            };

            let is_broadcast = matches!(&to, ToSpec::Single(s) if s == "*");
            let target = if is_broadcast {
                SendTarget::Broadcast
            } else {
                match to.agent_ids() {
                    Ok(ids) if ids.len() == 1 => {
                        SendTarget::Single(ids.into_iter().next().unwrap())
                    }
                    Ok(ids) => SendTarget::Set(ids.into_iter().collect()),
                    Err(err) => return Some(ServerFrame::Error { message: err }),
                }
            };

            let options = SendOptions {
                priority: priority.unwrap_or_default(),
                requires_ack,
                requires_read_receipt,
                metadata,
                message_type: None,
                confirmation_chain_depth: None,
            };

            match state.engine.send(from, target, content, options).await {
                Ok(message) => Some(ServerFrame::MessageSent {
                    message_id: message.id,
                    status: "queued".to_string(),
                }),
                Err(err) => Some(ServerFrame::Error {
                    message: err.to_string(),
                }),
            }
        }
        ClientFrame::Acknowledge { message_id } => {
            let Some((agent_id, instance_id)) = registered.clone() else {
                return Some(ServerFrame::Error {
                    message: "must register before acknowledging".to_string(),
                });
            };
            state
                .engine
                .process_ack(message_id, AckKind::Delivery, agent_id, instance_id)
                .await;
            None
        }
        ClientFrame::ReadReceipt { message_id } => {
            let Some((agent_id, instance_id)) = registered.clone() else {
                return Some(ServerFrame::Error {
                    message: "must register before sending a read receipt".to_string(),
                });
            };
            state
                .engine
                .process_ack(message_id, AckKind::Read, agent_id, instance_id)
                .await;
            None
        }
        ClientFrame::Heartbeat => {
            if let Some((agent_id, instance_id)) = registered.clone() {
                if let Some(entry) = state.sessions.get(&agent_id, &instance_id) {
                    *entry.last_heartbeat.lock().await = Timestamp::now();
                }
                state.registry.touch(agent_id, instance_id).await;
            }
            Some(ServerFrame::HeartbeatAck)
        }
        ClientFrame::GetStatus {
            message_id,
            agent_id,
        } => {
            if let Some(message_id) = message_id {
                let payload = match state.engine.status(message_id).await {
                    Some(message) => serde_json::to_value(message).unwrap_or(Value::Null),
                    None => json!({ "found": false }),
                };
                Some(ServerFrame::Status { payload })
            } else if let Some(agent_id) = agent_id {
                let payload = match AgentId::try_new(agent_id) {
                    Ok(id) => {
                        let instances = state.registry.live_instances(id).await;
                        serde_json::to_value(instances).unwrap_or(Value::Null)
                    }
                    Err(err) => json!({ "error": err.to_string() }),
                };
                Some(ServerFrame::Status { payload })
            } else {
                let payload = json!({
                    "connectedSessions": state.sessions.len(),
                    "pendingMessages": state.engine.all_pending().await.len(),
                });
                Some(ServerFrame::Status { payload })
            }
        }
    }
}
