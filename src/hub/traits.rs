//! Trait contracts for the hub's components (C1–C5) and the error types
//! they raise.
//!
//! Mirrors the split used elsewhere in this codebase for routing
//! components: one `thiserror` enum per component, async traits for
//! anything that may suspend, plain traits for anything that must not.

use crate::domain_types::AgentId;
use crate::hub::domain_types::{
    AgentInstance, Envelope, InstanceId, LifecycleEvent, MessageId, MessageStatus, SendOptions,
    SendTarget, SessionId, TrackedMessage,
};
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by the instance registry (C1).
///
/// Per the registry's contract, ordinary lookups never fail — this type
/// exists for completeness and for the rare construction-time error.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry was asked to operate on an agent id that failed
    /// validation before reaching the registry.
    #[error("invalid agent identifier: {reason}")]
    InvalidAgentId {
        /// Why validation failed.
        reason: String,
    },
}

/// Errors raised by the delivery engine (C2).
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// `send` was called with `messageType=confirmation` and
    /// `confirmationChainDepth > 0` already set, which would let a
    /// confirmation beget another confirmation.
    #[error("a confirmation message cannot itself request a confirmation")]
    ConfirmationLoopRejected,

    /// `send` was called with an empty A2MA recipient set.
    #[error("a2ma send requires at least one recipient")]
    EmptyRecipientSet,

    /// The dispatch fabric failed while the engine was attempting
    /// delivery.
    #[error("dispatch failed during delivery attempt: {source}")]
    DispatchFailed {
        /// The underlying dispatch error.
        #[source]
        source: DispatchError,
    },
}

/// Errors raised by the dispatch fabric (C3).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No session is registered for the target instance.
    #[error("no live session for {agent_id}/{instance_id}")]
    NoSession {
        /// The target agent.
        agent_id: AgentId,
        /// The target instance.
        instance_id: InstanceId,
    },

    /// The session's outbound channel could not accept the frame (closed
    /// or full).
    #[error("transport write failed for {agent_id}/{instance_id}")]
    TransportWriteFailed {
        /// The target agent.
        agent_id: AgentId,
        /// The target instance.
        instance_id: InstanceId,
    },
}

/// Errors raised by the push server (C4).
#[derive(Debug, Error)]
pub enum PushServerError {
    /// A client frame failed to parse as JSON or had an unknown `type`.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Human-readable parse failure.
        reason: String,
    },

    /// A `send_message` frame was missing a required field.
    #[error("missing required field `{field}` in send_message")]
    MissingField {
        /// The missing field's name.
        field: String,
    },

    /// The server could not bind its listening socket.
    #[error("failed to bind push server: {source}")]
    BindFailed {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Resolution of a send: which agents were targeted and in what mode.
#[derive(Debug, Clone)]
pub struct ResolvedTargets {
    /// The agents a send will attempt to reach.
    pub agents: std::collections::HashSet<AgentId>,
    /// The mode the send was resolved under.
    pub mode: crate::hub::domain_types::DeliveryMode,
}

/// C1 — name resolution from a logical `agentId` to its online instances.
///
/// None of these operations fail: unknown agents simply return empty
/// results, matching the "failure semantics: none of these operations
/// fail" contract in the specification this trait implements.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Upserts an instance, marking it online and refreshing `lastSeen`.
    /// Replaces any prior entry with the same `(agentId, instanceId)` key.
    async fn register(
        &self,
        agent_id: AgentId,
        instance_id: InstanceId,
        capabilities: std::collections::HashSet<String>,
        session_id: Option<SessionId>,
    );

    /// Marks an instance offline. The entry is retained for observability
    /// until the idle purge.
    async fn mark_offline(&self, agent_id: AgentId, instance_id: InstanceId);

    /// Online instances for an agent, freshest `lastSeen` first.
    async fn live_instances(&self, agent_id: AgentId) -> Vec<AgentInstance>;

    /// Every agent id with at least one online instance.
    async fn all_live_agent_ids(&self) -> std::collections::HashSet<AgentId>;

    /// Refreshes `lastSeen` for an instance, e.g. on heartbeat.
    async fn touch(&self, agent_id: AgentId, instance_id: InstanceId);
}

/// C2 — owns the lifecycle of every in-flight message.
#[async_trait]
pub trait DeliveryEngine: Send + Sync {
    /// Records a new tracked message and asynchronously begins delivery.
    /// Returns the tracked message's initial (`pending`) snapshot.
    async fn send(
        &self,
        from: AgentId,
        to: SendTarget,
        content: serde_json::Value,
        options: SendOptions,
    ) -> Result<TrackedMessage, DeliveryError>;

    /// Processes an acknowledgment (delivery ack or read receipt).
    /// Unknown messages and duplicate acks are ignored, not errors.
    async fn process_ack(
        &self,
        message_id: MessageId,
        kind: crate::hub::domain_types::AckKind,
        from: AgentId,
        from_instance: InstanceId,
    );

    /// Current snapshot of a tracked message, if it still exists.
    async fn status(&self, message_id: MessageId) -> Option<TrackedMessage>;

    /// All currently tracked (in-flight) messages.
    async fn all_pending(&self) -> Vec<TrackedMessage>;

    /// Evicts every tracked message older than `max_age`. Invoked by the
    /// sweeper; exposed here so the facade can drive it without reaching
    /// into the engine's internals.
    async fn sweep(&self, max_age: std::time::Duration) -> usize;
}

/// C3 — couples the engine to the transport, and the transport to the
/// event bus. The only component permitted to hold transport references
/// inside the engine's call paths.
#[async_trait]
pub trait DispatchFabric: Send + Sync {
    /// Pushes an outbound deliver frame to a specific instance.
    async fn emit_deliver(&self, envelope: Envelope) -> Result<(), DispatchError>;

    /// Publishes a lifecycle event via the event bus.
    async fn emit_event(&self, event: LifecycleEvent);
}

/// C5 — minimal in-process publish/subscribe. Delivery to subscribers is
/// synchronous; subscribers must not block.
pub trait EventBus: Send + Sync {
    /// Registers a subscriber for a topic. Returns a handle that can be
    /// used to unsubscribe.
    fn subscribe(
        &self,
        topic: &str,
        handler: Box<dyn Fn(&LifecycleEvent) + Send + Sync>,
    ) -> SubscriptionHandle;

    /// Removes a previously registered subscription.
    fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Publishes an event to every subscriber of its topic.
    fn publish(&self, event: LifecycleEvent);
}

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// The external memory-store collaborator (durable archive / search
/// index). Consumed, never implemented, by the core — see the
/// specification's "out of scope" note. A concrete adapter lives outside
/// this crate; this trait exists so the core can accept one without
/// depending on its implementation.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persists a record, returning its store-assigned id.
    async fn store(
        &self,
        agent_id: AgentId,
        record: serde_json::Value,
        scope: &str,
        kind: &str,
    ) -> Result<String, MemoryStoreError>;

    /// Searches previously stored records.
    async fn search(
        &self,
        query: &str,
        scope: Option<&str>,
        limit: Option<usize>,
        since: Option<crate::hub::domain_types::Timestamp>,
    ) -> Result<Vec<serde_json::Value>, MemoryStoreError>;

    /// Updates a previously stored record.
    async fn update(
        &self,
        id: &str,
        record: serde_json::Value,
        scope: &str,
    ) -> Result<(), MemoryStoreError>;
}

/// Errors surfaced by a `MemoryStore` implementation. Opaque by design —
/// the core only logs and forwards these, it never branches on them.
#[derive(Debug, Error)]
#[error("memory store operation failed: {reason}")]
pub struct MemoryStoreError {
    /// Human-readable failure reason from the collaborator.
    pub reason: String,
}

/// Snapshot returned by [`crate::hub::facade::Hub::stats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct HubStats {
    /// Number of currently connected push-server sessions.
    pub connected_sessions: usize,
    /// Number of tracked messages still in flight.
    pub pending_messages: usize,
    /// Snapshot of every known agent instance.
    pub instances: Vec<AgentInstance>,
}

/// Snapshot returned by [`crate::hub::facade::Hub::health`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct HubHealth {
    /// Overall health status.
    pub status: HealthStatus,
    /// Enabled feature flags (currently just `enhanced`).
    pub features: Vec<String>,
    /// Point-in-time counters useful for a health dashboard.
    pub counters: HubCounters,
}

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HealthStatus {
    /// Everything is operating normally.
    Healthy,
    /// Operating, but with a condition worth surfacing (e.g. near a
    /// configured capacity bound).
    Degraded,
}

/// Point-in-time counters reported by `health()`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct HubCounters {
    /// Number of `send` calls since startup.
    pub messages_sent: u64,
    /// Number of messages that ended in `failed`.
    pub messages_failed: u64,
    /// Number of messages that ended in `timeout`.
    pub messages_timed_out: u64,
}

/// A terminal outcome recorded for metrics/health purposes; kept distinct
/// from `MessageStatus` so the engine can record "this reached a terminal
/// state" without the health counters needing to match on every status
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// The message was fully read (or acknowledged, if read receipts were
    /// not required).
    Succeeded,
    /// The message exhausted its retries.
    Failed,
    /// The ack timer expired.
    TimedOut,
}

impl From<MessageStatus> for Option<TerminalOutcome> {
    fn from(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Read | MessageStatus::Acknowledged => Some(TerminalOutcome::Succeeded),
            MessageStatus::Failed => Some(TerminalOutcome::Failed),
            MessageStatus::Timeout => Some(TerminalOutcome::TimedOut),
            _ => None,
        }
    }
}
