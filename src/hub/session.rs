//! Shared session table: the one place that knows how to reach a connected
//! push-server client by `(agentId, instanceId)`.
//!
//! Both the push server (which owns the accept loop and writes frames out)
//! and the dispatch fabric (which wants to push `deliver` envelopes and
//! broadcast lifecycle events without knowing anything about WebSockets)
//! hold a clone of this table, avoiding a construction cycle between the
//! two components.

use crate::domain_types::AgentId;
use crate::hub::domain_types::{InstanceId, SessionId, Timestamp};
use crate::hub::push_server::ServerFrame;
use crate::hub::traits::DispatchError;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One connected client, as tracked internally by the session table.
pub struct SessionEntry {
    /// Server-assigned session id.
    pub session_id: SessionId,
    /// Outbound frame sender; serializes writes onto this session (the
    /// "per-session write lock" from the concurrency model, implemented as
    /// an mpsc queue feeding a single writer task).
    sender: mpsc::UnboundedSender<ServerFrame>,
    /// Agent ids this session wants lifecycle events for.
    pub subscriptions: Mutex<HashSet<AgentId>>,
    /// Last heartbeat time, refreshed by `register`, `touch`, and
    /// `heartbeat` frames.
    pub last_heartbeat: Mutex<Timestamp>,
    /// Capabilities reported at registration.
    pub capabilities: HashSet<String>,
    /// Cancelled to tell this session's `handle_socket` task to close the
    /// connection, e.g. when the heartbeat sweeper evicts it or a prior
    /// session is displaced by re-registration.
    pub closed: CancellationToken,
}

/// Registry of live sessions, keyed by `(agentId, instanceId)`.
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<DashMap<(AgentId, InstanceId), Arc<SessionEntry>>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// An empty session table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Registers a new session, evicting any prior session for the same
    /// `(agentId, instanceId)` key (enforcing "one session per instance;
    /// re-registration evicts any prior session") and cancelling its close
    /// token so the displaced connection's `handle_socket` task exits.
    ///
    /// Returns the new session's close token, so the caller's own
    /// `handle_socket` loop can race it alongside the socket's read/write
    /// futures.
    pub fn insert(
        &self,
        agent_id: AgentId,
        instance_id: InstanceId,
        session_id: SessionId,
        capabilities: HashSet<String>,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> CancellationToken {
        let closed = CancellationToken::new();
        let entry = Arc::new(SessionEntry {
            session_id,
            sender,
            subscriptions: Mutex::new(HashSet::from([agent_id.clone()])),
            last_heartbeat: Mutex::new(Timestamp::now()),
            capabilities,
            closed: closed.clone(),
        });
        if let Some((_, prior)) = self.sessions.remove(&(agent_id.clone(), instance_id.clone())) {
            prior.closed.cancel();
        }
        self.sessions.insert((agent_id, instance_id), entry);
        closed
    }

    /// Removes a session, e.g. on socket close or heartbeat timeout.
    /// Returns the removed entry, if one was present, so the caller can
    /// tell whether it actually performed the removal — used to make
    /// "close this session" idempotent when the sweeper and the socket's
    /// own exit path race.
    pub fn remove(
        &self,
        agent_id: AgentId,
        instance_id: InstanceId,
    ) -> Option<Arc<SessionEntry>> {
        self.sessions
            .remove(&(agent_id, instance_id))
            .map(|(_, entry)| entry)
    }

    /// Number of currently connected sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether any sessions are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sends a frame to a specific instance's session.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoSession`] if no session is registered for
    /// the target, or [`DispatchError::TransportWriteFailed`] if the
    /// session's outbound channel has closed.
    pub fn send_to(
        &self,
        agent_id: AgentId,
        instance_id: InstanceId,
        frame: ServerFrame,
    ) -> Result<(), DispatchError> {
        let entry = self
            .sessions
            .get(&(agent_id.clone(), instance_id.clone()))
            .ok_or_else(|| DispatchError::NoSession {
                agent_id: agent_id.clone(),
                instance_id: instance_id.clone(),
            })?;

        entry
            .sender
            .send(frame)
            .map_err(|_| DispatchError::TransportWriteFailed {
                agent_id,
                instance_id,
            })
    }

    /// Broadcasts a frame to every session whose subscriptions intersect
    /// `relevant_agents`, or to every session if `relevant_agents` is empty
    /// (used for `agent.online`/`agent.offline`, which fan out to all
    /// sessions).
    pub async fn broadcast(&self, relevant_agents: &HashSet<AgentId>, frame: ServerFrame) {
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for entry in entries {
            let interested = if relevant_agents.is_empty() {
                true
            } else {
                let subscriptions = entry.subscriptions.lock().await;
                subscriptions.intersection(relevant_agents).next().is_some()
            };
            if interested {
                let _ = entry.sender.send(frame.clone());
            }
        }
    }

    /// Looks up a session entry by `(agentId, instanceId)`.
    #[must_use]
    pub fn get(&self, agent_id: &AgentId, instance_id: &InstanceId) -> Option<Arc<SessionEntry>> {
        self.sessions
            .get(&(agent_id.clone(), instance_id.clone()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Looks up the `(agentId, instanceId)` owning a session, by session
    /// id. Used to resolve which instance goes offline when a socket
    /// closes.
    #[must_use]
    pub fn find_by_session(&self, session_id: SessionId) -> Option<(AgentId, InstanceId)> {
        self.sessions
            .iter()
            .find(|entry| entry.value().session_id == session_id)
            .map(|entry| entry.key().clone())
    }

    /// Every `(agentId, instanceId, lastHeartbeat)` triple, for the push
    /// server's heartbeat-sweep loop.
    #[must_use]
    pub fn heartbeat_snapshot(&self) -> Vec<(AgentId, InstanceId, Arc<SessionEntry>)> {
        self.sessions
            .iter()
            .map(|entry| {
                let (agent_id, instance_id) = entry.key().clone();
                (agent_id, instance_id, entry.value().clone())
            })
            .collect()
    }
}
