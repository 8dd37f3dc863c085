//! Domain types for the message hub.
//!
//! These types model the wire-level and in-memory shapes described by the
//! hub's data model: agent instances, tracked messages, envelopes, and
//! sessions. Free-form fields (`content`, `metadata`, `capabilities`) are
//! kept as opaque JSON values or string sets — the hub assigns no semantics
//! to them beyond forwarding and logging.

use crate::domain_types::AgentId;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Unique identifier for a tracked message.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a new random message id.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier for one concurrent embodiment of an agent.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct InstanceId(String);

/// Server-scoped identifier assigned to a push-server connection at accept
/// time.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a new random session id.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Free-form topic name used by the event bus.
#[nutype(
    validate(len_char_min = 1, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TopicName(String);

/// A point in time, wrapping `SystemTime` so the domain model never leaks
/// a raw `std::time` type at its boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// The current time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Elapsed time since this timestamp was recorded.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed().unwrap_or_default()
    }
}

/// How a send's recipients were determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Exactly one target agent.
    A2A,
    /// A set of target agents.
    A2MA,
    /// Every currently-online agent except the sender, frozen at send time.
    Broadcast,
}

/// The recipient set a sender named on `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendTarget {
    /// A single recipient agent.
    Single(AgentId),
    /// An explicit set of recipient agents (A2MA).
    Set(HashSet<AgentId>),
    /// Every online agent except the sender.
    Broadcast,
}

/// What a tracked message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// An ordinary sender-authored message.
    Content,
    /// A system-generated delivery or read confirmation.
    Confirmation,
    /// An internal, non-content control message.
    System,
}

/// Sender-assigned delivery priority. Carried but not interpreted by the
/// core beyond forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Low priority.
    Low,
    /// Default priority for content messages.
    #[default]
    Medium,
    /// High priority.
    High,
    /// Critical priority.
    Critical,
}

/// The kind of acknowledgment a recipient sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckKind {
    /// The message arrived at the recipient's runtime.
    Delivery,
    /// The message was observed by the receiving agent logic.
    Read,
}

/// Position of a tracked message (or a single recipient, for multi-recipient
/// modes) on the delivery lifecycle's total order.
///
/// `pending < sent < delivered < acknowledged < read`; `timeout` and
/// `failed` are absorbing terminal states outside that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Recorded by `send`, no attempt made yet.
    Pending,
    /// An attempt is or has been in flight.
    Sent,
    /// At least one live instance accepted the envelope.
    Delivered,
    /// A delivery ack was processed.
    Acknowledged,
    /// A read receipt was processed.
    Read,
    /// The ack timer expired before an ack arrived.
    Timeout,
    /// All delivery attempts were exhausted without success.
    Failed,
}

impl MessageStatus {
    /// Whether this status is one of the two absorbing terminal states that
    /// fall outside the `pending..read` total order.
    #[must_use]
    pub fn is_absorbing_terminal(self) -> bool {
        matches!(self, Self::Timeout | Self::Failed)
    }

    /// Whether this status can no longer change (terminal on the happy path
    /// or absorbing).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Timeout | Self::Failed)
    }

    /// Whether this status is final for a message that never requires any
    /// acknowledgment (`requiresAck=false`): `delivered` is already the end
    /// of the line for such a message, since no ack will ever arrive to
    /// advance it further.
    #[must_use]
    pub fn is_terminal_no_ack_required(self) -> bool {
        matches!(self, Self::Delivered | Self::Read | Self::Timeout | Self::Failed)
    }
}

/// Per-recipient tracking for A2MA and broadcast sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientState {
    /// This recipient's own position on the lifecycle.
    pub status: MessageStatus,
    /// When this recipient's instance accepted the envelope.
    pub delivered_at: Option<Timestamp>,
    /// When this recipient acknowledged delivery.
    pub acknowledged_at: Option<Timestamp>,
    /// When this recipient sent a read receipt.
    pub read_at: Option<Timestamp>,
}

impl RecipientState {
    /// A fresh per-recipient record in the initial `pending` state.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: MessageStatus::Pending,
            delivered_at: None,
            acknowledged_at: None,
            read_at: None,
        }
    }

    /// Whether this recipient has reached a terminal state.
    ///
    /// `read_receipts_required` controls whether `acknowledged` also counts
    /// as terminal (the non-strict form of termination described in the
    /// multi-recipient aggregate semantics design note). This predicate is
    /// for messages that require at least a delivery ack; for
    /// `requiresAck=false` messages use
    /// [`RecipientState::is_terminal_no_ack_required`] instead, since
    /// `delivered` itself is already final there.
    #[must_use]
    pub fn is_terminal(&self, read_receipts_required: bool) -> bool {
        match self.status {
            MessageStatus::Read | MessageStatus::Failed => true,
            MessageStatus::Acknowledged => !read_receipts_required,
            _ => false,
        }
    }

    /// Whether this recipient has reached a terminal state for a message
    /// that never requires any acknowledgment.
    #[must_use]
    pub fn is_terminal_no_ack_required(&self) -> bool {
        self.status.is_terminal_no_ack_required()
    }
}

/// Caller-supplied options on a `send` call.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Delivery priority; defaults to `Medium`.
    pub priority: Priority,
    /// Whether a delivery ack is required; defaults to `true` for content
    /// messages.
    pub requires_ack: Option<bool>,
    /// Whether a read receipt is required; defaults to mirror
    /// `requires_ack`.
    pub requires_read_receipt: Option<bool>,
    /// Free-form metadata forwarded verbatim.
    pub metadata: Option<Value>,
    /// Set only when synthesizing a confirmation message.
    pub message_type: Option<MessageType>,
    /// Set only when synthesizing a confirmation message.
    pub confirmation_chain_depth: Option<u32>,
}

/// The engine's in-memory record governing a single in-flight send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedMessage {
    /// Globally unique message id.
    pub id: MessageId,
    /// Sending agent.
    pub from: AgentId,
    /// Named recipients, as given to `send`.
    pub to: SendTarget,
    /// How `to` was interpreted.
    pub delivery_mode: DeliveryMode,
    /// Opaque payload.
    pub content: Value,
    /// What kind of message this is.
    pub message_type: MessageType,
    /// Sender-assigned priority.
    pub priority: Priority,
    /// Free-form metadata.
    pub metadata: Value,
    /// When this record was created by `send`.
    pub created_at: Timestamp,

    /// Current top-level status.
    pub status: MessageStatus,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// Timestamp of the most recent attempt.
    pub last_attempt_at: Option<Timestamp>,
    /// Timestamp the top-level status became `delivered`.
    pub delivered_at: Option<Timestamp>,
    /// Timestamp the top-level status became `acknowledged`.
    pub acknowledged_at: Option<Timestamp>,
    /// Timestamp the top-level status became `read`.
    pub read_at: Option<Timestamp>,
    /// Timestamp the message became `timeout` or `failed`.
    pub timeout_at: Option<Timestamp>,

    /// Present iff `delivery_mode != A2A`: per-recipient tracking.
    pub recipient_state: Option<HashMap<AgentId, RecipientState>>,

    /// How many confirmation hops produced this message; `0` for
    /// sender-authored content, `1` for a first-generation confirmation.
    pub confirmation_chain_depth: u32,
    /// `"{agentId}:{kind}"` keys of acks already processed, to make
    /// duplicate acks idempotent.
    pub processed_keys: HashSet<String>,

    /// Whether a delivery ack is required before the message can progress
    /// past `delivered`.
    pub requires_ack: bool,
    /// Whether a read receipt is required before the message is considered
    /// fully terminal.
    pub requires_read_receipt: bool,
}

impl TrackedMessage {
    /// The `"{agentId}:{kind}"` key used for ack deduplication.
    #[must_use]
    pub fn ack_key(agent: AgentId, kind: AckKind) -> String {
        let kind = match kind {
            AckKind::Delivery => "delivery",
            AckKind::Read => "read",
        };
        format!("{agent}:{kind}")
    }

    /// The target agent ids, resolved from `to`. For broadcast this reads
    /// the frozen expansion recorded in `to` at send time, never
    /// re-evaluating live instances.
    #[must_use]
    pub fn target_agents(&self) -> HashSet<AgentId> {
        match &self.to {
            SendTarget::Single(agent) => HashSet::from([agent.clone()]),
            SendTarget::Set(agents) => agents.clone(),
            SendTarget::Broadcast => self
                .recipient_state
                .as_ref()
                .map(|state| state.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Whether every recipient (A2MA/broadcast) or the sole recipient (A2A)
    /// has reached a terminal state, for a message that requires at least
    /// a delivery ack.
    #[must_use]
    pub fn all_recipients_terminal(&self) -> bool {
        match &self.recipient_state {
            Some(state) => state
                .values()
                .all(|r| r.is_terminal(self.requires_read_receipt)),
            None => self.status.is_terminal(),
        }
    }

    /// Whether every recipient (A2MA/broadcast) or the sole recipient (A2A)
    /// has reached a terminal state, for a message that never requires any
    /// acknowledgment (`requiresAck=false`) — `delivered` itself counts as
    /// terminal here, since no ack will ever arrive to advance it further.
    #[must_use]
    pub fn all_recipients_terminal_no_ack_required(&self) -> bool {
        match &self.recipient_state {
            Some(state) => state
                .values()
                .all(RecipientState::is_terminal_no_ack_required),
            None => self.status.is_terminal_no_ack_required(),
        }
    }
}

/// The wire-level unit the dispatch fabric pushes to a specific instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// What this envelope is for.
    pub kind: EnvelopeKind,
    /// The tracked message this envelope carries or refers to.
    pub message_id: MessageId,
    /// Sending agent.
    pub from: AgentId,
    /// The specific recipient instance this envelope targets.
    pub to_instance: (AgentId, InstanceId),
    /// Opaque payload.
    pub payload: Value,
    /// Sender-assigned priority, forwarded so `message.received` carries it.
    pub priority: Priority,
    /// Free-form metadata, forwarded verbatim.
    pub metadata: Value,
    /// Whether the recipient is expected to ack/read-receipt this envelope.
    pub flags: EnvelopeFlags,
}

/// What kind of operation an envelope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Deliver message content to a recipient instance.
    Deliver,
    /// Request a delivery acknowledgment (currently unused on the wire; the
    /// client acks proactively, but reserved for future server-initiated
    /// ack requests).
    AckRequest,
    /// Request a read receipt (reserved, see `AckRequest`).
    ReadRequest,
    /// A lifecycle event being pushed to a subscribed session.
    LifecycleEvent,
}

/// Policy flags carried on an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeFlags {
    /// Whether the recipient must send a delivery ack.
    pub requires_ack: bool,
    /// Whether the recipient must send a read receipt.
    pub requires_read_receipt: bool,
}

/// One connected push-server client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Server-assigned session id.
    pub session_id: SessionId,
    /// The agent this session authenticates as.
    pub agent_id: AgentId,
    /// The instance this session represents.
    pub instance_id: InstanceId,
    /// Agent ids this session wants lifecycle events for.
    pub subscriptions: HashSet<AgentId>,
    /// Last heartbeat time.
    pub last_heartbeat: Timestamp,
    /// Capabilities reported at registration.
    pub capabilities: HashSet<String>,
}

/// One known agent instance (owned by the instance registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Logical agent identity.
    pub agent_id: AgentId,
    /// Instance identity, unique within the agent.
    pub instance_id: InstanceId,
    /// Whether this instance currently has a live session.
    pub online: bool,
    /// Last time this instance was seen (registration, heartbeat, or
    /// touch).
    pub last_seen: Timestamp,
    /// Capabilities reported at registration.
    pub capabilities: HashSet<String>,
    /// The session this instance is attached to, if any.
    pub session_id: Option<SessionId>,
}

impl AgentInstance {
    /// A freshly registered instance.
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        instance_id: InstanceId,
        capabilities: HashSet<String>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            agent_id,
            instance_id,
            online: true,
            last_seen: Timestamp::now(),
            capabilities,
            session_id,
        }
    }
}

/// A lifecycle event published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// The event topic, e.g. `"message.acknowledged"`.
    pub topic: String,
    /// The agent ids this event concerns, used for subscription-based
    /// fan-out in the push server.
    pub relevant_agents: HashSet<AgentId>,
    /// Event payload.
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_key_distinguishes_kind() {
        let agent = AgentId::generate();
        assert_ne!(
            TrackedMessage::ack_key(agent.clone(), AckKind::Delivery),
            TrackedMessage::ack_key(agent, AckKind::Read)
        );
    }

    #[test]
    fn recipient_state_acknowledged_is_terminal_only_without_read_receipts() {
        let mut state = RecipientState::pending();
        state.status = MessageStatus::Acknowledged;
        assert!(state.is_terminal(false));
        assert!(!state.is_terminal(true));
    }

    #[test]
    fn recipient_state_read_and_failed_are_always_terminal() {
        let mut state = RecipientState::pending();
        state.status = MessageStatus::Read;
        assert!(state.is_terminal(true));
        state.status = MessageStatus::Failed;
        assert!(state.is_terminal(true));
    }

    #[test]
    fn message_status_distinguishes_absorbing_from_happy_path_terminal() {
        assert!(MessageStatus::Timeout.is_absorbing_terminal());
        assert!(MessageStatus::Failed.is_absorbing_terminal());
        assert!(!MessageStatus::Read.is_absorbing_terminal());
        assert!(MessageStatus::Read.is_terminal());
    }
}
