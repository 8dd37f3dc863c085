//! C2 — Delivery Engine: owns the lifecycle of every in-flight message.
//!
//! Each tracked message lives in a `DashMap` entry, giving it its own
//! effective lock (mutation happens through `DashMap::get_mut`, never
//! through a single table-wide mutex) per the concurrency model's "each of
//! these has exactly one authoritative owner" rule. Retry and ack timers
//! are `tokio::spawn`ed tasks guarded by a `CancellationToken` stored
//! alongside the message, so cancellation is idempotent and never blocks
//! on I/O.

use crate::domain_types::AgentId;
use crate::hub::config::HubConfig;
use crate::hub::domain_types::{
    AckKind, DeliveryMode, Envelope, EnvelopeFlags, EnvelopeKind, LifecycleEvent, MessageId,
    MessageStatus, MessageType, Priority, RecipientState, SendOptions, SendTarget, Timestamp,
    TrackedMessage,
};
use crate::hub::traits::{DeliveryEngine, DeliveryError, DispatchFabric, InstanceRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

struct TimerHandles {
    ack: CancellationToken,
    retry: CancellationToken,
}

/// The default [`DeliveryEngine`] implementation.
pub struct DeliveryEngineImpl {
    messages: DashMap<MessageId, TrackedMessage>,
    timers: DashMap<MessageId, TimerHandles>,
    registry: Arc<dyn InstanceRegistry>,
    dispatch: Arc<dyn DispatchFabric>,
    config: HubConfig,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    messages_timed_out: AtomicU64,
}

impl DeliveryEngineImpl {
    /// Builds an engine over a registry and dispatch fabric, using the
    /// timeouts and retry policy from `config`.
    #[must_use]
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        dispatch: Arc<dyn DispatchFabric>,
        config: HubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            messages: DashMap::new(),
            timers: DashMap::new(),
            registry,
            dispatch,
            config,
            messages_sent: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_timed_out: AtomicU64::new(0),
        })
    }

    /// Point-in-time counters, for the facade's `health()`.
    #[must_use]
    pub fn counters(&self) -> crate::hub::traits::HubCounters {
        crate::hub::traits::HubCounters {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_timed_out: self.messages_timed_out.load(Ordering::Relaxed),
        }
    }

    /// Cancels every outstanding ack/retry timer and drops all tracked
    /// message state. Called by the facade's `stop()`; any message still
    /// in flight is abandoned without a further status transition or
    /// event — shutdown is not itself a delivery outcome.
    pub fn shutdown(&self) {
        for entry in self.timers.iter() {
            entry.value().ack.cancel();
            entry.value().retry.cancel();
        }
        self.timers.clear();
        self.messages.clear();
    }

    fn internal_send(
        self: &Arc<Self>,
        from: AgentId,
        to: SendTarget,
        content: serde_json::Value,
        options: SendOptions,
        live_broadcast_targets: Option<HashSet<AgentId>>,
    ) -> Result<TrackedMessage, DeliveryError> {
        let message_type = options.message_type.unwrap_or(MessageType::Content);
        let confirmation_chain_depth = options.confirmation_chain_depth.unwrap_or(0);

        if message_type == MessageType::Confirmation && confirmation_chain_depth != 1 {
            return Err(DeliveryError::ConfirmationLoopRejected);
        }

        if let SendTarget::Set(ref agents) = to {
            if agents.is_empty() {
                return Err(DeliveryError::EmptyRecipientSet);
            }
        }

        let delivery_mode = match &to {
            SendTarget::Single(_) => DeliveryMode::A2A,
            SendTarget::Set(_) => DeliveryMode::A2MA,
            SendTarget::Broadcast => DeliveryMode::Broadcast,
        };

        let (requires_ack, requires_read_receipt) = if message_type == MessageType::Content {
            let ack = options.requires_ack.unwrap_or(true);
            (ack, options.requires_read_receipt.unwrap_or(ack))
        } else {
            (false, false)
        };

        let recipient_state = match (&to, &live_broadcast_targets) {
            (SendTarget::Single(_), _) => None,
            (SendTarget::Set(agents), _) => Some(
                agents
                    .iter()
                    .map(|a| (a.clone(), RecipientState::pending()))
                    .collect::<HashMap<_, _>>(),
            ),
            (SendTarget::Broadcast, Some(targets)) => Some(
                targets
                    .iter()
                    .map(|a| (a.clone(), RecipientState::pending()))
                    .collect::<HashMap<_, _>>(),
            ),
            (SendTarget::Broadcast, None) => Some(HashMap::new()),
        };

        let message = TrackedMessage {
            id: MessageId::generate(),
            from,
            to,
            delivery_mode,
            content,
            message_type,
            priority: options.priority,
            metadata: options.metadata.unwrap_or_else(|| json!({})),
            created_at: Timestamp::now(),
            status: MessageStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            delivered_at: None,
            acknowledged_at: None,
            read_at: None,
            timeout_at: None,
            recipient_state,
            confirmation_chain_depth,
            processed_keys: HashSet::new(),
            requires_ack,
            requires_read_receipt,
        };

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.messages.insert(message.id, message.clone());
        Ok(message)
    }

    #[instrument(skip(self), fields(message_id = %message_id))]
    async fn attempt_delivery(self: Arc<Self>, message_id: MessageId) {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return;
        };

        entry.attempts += 1;
        entry.last_attempt_at = Some(Timestamp::now());
        entry.status = MessageStatus::Sent;
        let targets = entry.target_agents();
        let requires_ack = entry.requires_ack;
        let attempts = entry.attempts;
        drop(entry);

        let mut delivered_agents = HashSet::new();
        for agent in &targets {
            let instances = self.registry.live_instances(agent.clone()).await;
            let Some(instance) = instances.into_iter().next() else {
                self.mark_recipient(message_id, agent.clone(), MessageStatus::Failed);
                continue;
            };

            let Some(snapshot) = self.messages.get(&message_id).map(|m| m.clone()) else {
                return;
            };
            let envelope = Envelope {
                kind: EnvelopeKind::Deliver,
                message_id,
                from: snapshot.from.clone(),
                to_instance: (agent.clone(), instance.instance_id.clone()),
                payload: snapshot.content.clone(),
                priority: snapshot.priority,
                metadata: snapshot.metadata.clone(),
                flags: EnvelopeFlags {
                    requires_ack: snapshot.requires_ack,
                    requires_read_receipt: snapshot.requires_read_receipt,
                },
            };

            match self.dispatch.emit_deliver(envelope).await {
                Ok(()) => {
                    self.mark_recipient(message_id, agent.clone(), MessageStatus::Delivered);
                    delivered_agents.insert(agent.clone());
                }
                Err(err) => {
                    warn!(%agent, %err, "delivery attempt failed for recipient");
                    self.mark_recipient(message_id, agent.clone(), MessageStatus::Failed);
                }
            }
        }

        if delivered_agents.is_empty() {
            if attempts >= self.config.max_retries.into_inner() {
                self.finalize_failed(message_id).await;
            } else {
                self.schedule_retry(message_id, attempts);
            }
            return;
        }

        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return;
        };
        entry.status = MessageStatus::Delivered;
        entry.delivered_at = Some(Timestamp::now());
        let should_finalize = !requires_ack && entry.all_recipients_terminal_no_ack_required();
        drop(entry);

        if requires_ack {
            self.arm_ack_timer(message_id);
        } else if should_finalize {
            debug!("requiresAck=false and all recipients terminal, finalizing");
            self.messages.remove(&message_id);
            self.timers.remove(&message_id);
        }
    }

    fn mark_recipient(&self, message_id: MessageId, agent: AgentId, status: MessageStatus) {
        if let Some(mut entry) = self.messages.get_mut(&message_id) {
            if let Some(ref mut states) = entry.recipient_state {
                let recipient = states.entry(agent).or_insert_with(RecipientState::pending);
                recipient.status = status;
                match status {
                    MessageStatus::Delivered => recipient.delivered_at = Some(Timestamp::now()),
                    MessageStatus::Acknowledged => {
                        recipient.acknowledged_at = Some(Timestamp::now());
                    }
                    MessageStatus::Read => recipient.read_at = Some(Timestamp::now()),
                    _ => {}
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, message_id: MessageId, attempts_so_far: u32) {
        let backoff = self.config.base_backoff_ms.as_duration()
            * 2u32.saturating_pow(attempts_so_far.saturating_sub(1));
        let token = CancellationToken::new();
        self.timers
            .entry(message_id)
            .or_insert_with(|| TimerHandles {
                ack: CancellationToken::new(),
                retry: CancellationToken::new(),
            })
            .retry = token.clone();

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = sleep(backoff) => {
                    engine.attempt_delivery(message_id).await;
                }
                () = token.cancelled() => {}
            }
        });
    }

    fn arm_ack_timer(self: &Arc<Self>, message_id: MessageId) {
        let token = CancellationToken::new();
        self.timers
            .entry(message_id)
            .or_insert_with(|| TimerHandles {
                ack: CancellationToken::new(),
                retry: CancellationToken::new(),
            })
            .ack = token.clone();

        let engine = Arc::clone(self);
        let timeout = self.config.ack_timeout_ms.as_duration();
        tokio::spawn(async move {
            tokio::select! {
                () = sleep(timeout) => {
                    engine.finalize_timeout(message_id).await;
                }
                () = token.cancelled() => {}
            }
        });
    }

    fn cancel_timers(&self, message_id: MessageId) {
        if let Some((_, handles)) = self.timers.remove(&message_id) {
            handles.ack.cancel();
            handles.retry.cancel();
        }
    }

    async fn finalize_failed(self: &Arc<Self>, message_id: MessageId) {
        if let Some(mut entry) = self.messages.get_mut(&message_id) {
            entry.status = MessageStatus::Failed;
            entry.timeout_at = Some(Timestamp::now());
        }
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
        self.cancel_timers(message_id);

        if let Some(message) = self.messages.get(&message_id).map(|m| m.clone()) {
            self.dispatch
                .emit_event(LifecycleEvent {
                    topic: "delivery.failed".to_string(),
                    relevant_agents: HashSet::from([message.from]),
                    payload: json!({ "messageId": message_id.to_string() }),
                })
                .await;
        }
        info!("message delivery failed after exhausting retries");
        self.messages.remove(&message_id);
    }

    async fn finalize_timeout(self: &Arc<Self>, message_id: MessageId) {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }
        entry.status = MessageStatus::Timeout;
        entry.timeout_at = Some(Timestamp::now());
        let from = entry.from.clone();
        drop(entry);

        self.messages_timed_out.fetch_add(1, Ordering::Relaxed);
        self.cancel_timers(message_id);
        self.dispatch
            .emit_event(LifecycleEvent {
                topic: "acknowledgment.timeout".to_string(),
                relevant_agents: HashSet::from([from]),
                payload: json!({ "messageId": message_id.to_string() }),
            })
            .await;
        info!("ack timer expired, message timed out");
        self.messages.remove(&message_id);
    }

    async fn maybe_synthesize_confirmation(
        self: &Arc<Self>,
        original: &TrackedMessage,
        ack_from: AgentId,
        kind: AckKind,
    ) {
        if original.message_type != MessageType::Content {
            return;
        }

        let label = match kind {
            AckKind::Delivery => "DELIVERY_CONFIRMED",
            AckKind::Read => "READ_CONFIRMED",
        };

        let options = SendOptions {
            priority: Priority::Medium,
            requires_ack: Some(false),
            requires_read_receipt: Some(false),
            metadata: None,
            message_type: Some(MessageType::Confirmation),
            confirmation_chain_depth: Some(original.confirmation_chain_depth + 1),
        };

        let result = self.internal_send(
            ack_from,
            SendTarget::Single(original.from.clone()),
            json!({ "kind": label, "originalMessageId": original.id.to_string() }),
            options,
            None,
        );

        match result {
            Ok(confirmation) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.attempt_delivery(confirmation.id).await;
                });
            }
            Err(err) => {
                warn!(%err, "failed to synthesize confirmation message");
            }
        }
    }
}

#[async_trait]
impl DeliveryEngine for Arc<DeliveryEngineImpl> {
    async fn send(
        &self,
        from: AgentId,
        to: SendTarget,
        content: serde_json::Value,
        options: SendOptions,
    ) -> Result<TrackedMessage, DeliveryError> {
        let live_broadcast_targets = if matches!(to, SendTarget::Broadcast) {
            let mut live = self.registry.all_live_agent_ids().await;
            live.remove(&from);
            Some(live)
        } else {
            None
        };

        let message = self.internal_send(from, to, content, options, live_broadcast_targets)?;
        let engine = Arc::clone(self);
        let message_id = message.id;
        tokio::spawn(async move {
            engine.attempt_delivery(message_id).await;
        });
        Ok(message)
    }

    async fn process_ack(
        &self,
        message_id: MessageId,
        kind: AckKind,
        from: AgentId,
        _from_instance: crate::hub::domain_types::InstanceId,
    ) {
        let key = TrackedMessage::ack_key(from.clone(), kind);

        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return;
        };
        if entry.processed_keys.contains(&key) {
            return;
        }
        entry.processed_keys.insert(key);

        let is_multi = entry.recipient_state.is_some();
        if let Some(ref mut states) = entry.recipient_state {
            if let Some(recipient) = states.get_mut(&from) {
                match kind {
                    AckKind::Delivery => {
                        recipient.status = MessageStatus::Acknowledged;
                        recipient.acknowledged_at = Some(Timestamp::now());
                    }
                    AckKind::Read => {
                        recipient.status = MessageStatus::Read;
                        recipient.read_at = Some(Timestamp::now());
                    }
                }
            }
        }

        if !is_multi {
            match kind {
                AckKind::Delivery => {
                    entry.status = MessageStatus::Acknowledged;
                    entry.acknowledged_at = Some(Timestamp::now());
                }
                AckKind::Read => {
                    entry.status = MessageStatus::Read;
                    entry.read_at = Some(Timestamp::now());
                }
            }
        } else if entry.all_recipients_terminal() {
            let any_read = entry
                .recipient_state
                .as_ref()
                .map(|states| states.values().any(|r| r.status == MessageStatus::Read))
                .unwrap_or(false);
            entry.status = if any_read {
                MessageStatus::Read
            } else {
                MessageStatus::Acknowledged
            };
        }

        let requires_read_receipt = entry.requires_read_receipt;
        let all_terminal = entry.all_recipients_terminal();
        let message = entry.clone();
        drop(entry);

        if kind == AckKind::Delivery {
            let cancel_ack_timer = if is_multi {
                message
                    .recipient_state
                    .as_ref()
                    .map(|states| {
                        states
                            .values()
                            .all(|r| matches!(r.status, MessageStatus::Acknowledged | MessageStatus::Read | MessageStatus::Failed))
                    })
                    .unwrap_or(false)
            } else {
                true
            };
            if cancel_ack_timer {
                if let Some((_, handles)) = self.timers.remove(&message_id) {
                    handles.ack.cancel();
                    handles.retry.cancel();
                }
            }
        }

        self.maybe_synthesize_confirmation(&message, from.clone(), kind)
            .await;

        // Delivery acks surface as two distinct topics: `delivery.confirmed`
        // (the sender-facing "it arrived" notice) followed by
        // `message.acknowledged` (the state-transition record). Read
        // receipts surface as a single `message.read`. This ordering is
        // what the round-trip property in the testable-properties section
        // observes for a delivery-ack-then-read-receipt sequence.
        let topics: &[&str] = match kind {
            AckKind::Delivery => &["delivery.confirmed", "message.acknowledged"],
            AckKind::Read => &["message.read"],
        };
        for topic in topics {
            self.dispatch
                .emit_event(LifecycleEvent {
                    topic: (*topic).to_string(),
                    relevant_agents: HashSet::from([message.from.clone()]),
                    payload: json!({ "messageId": message_id.to_string(), "from": from.to_string() }),
                })
                .await;
        }

        let terminate = if is_multi {
            all_terminal
        } else {
            matches!(kind, AckKind::Read) || (kind == AckKind::Delivery && !requires_read_receipt)
        };

        if terminate {
            self.cancel_timers(message_id);
            self.messages.remove(&message_id);
        }
    }

    async fn status(&self, message_id: MessageId) -> Option<TrackedMessage> {
        self.messages.get(&message_id).map(|m| m.clone())
    }

    async fn all_pending(&self) -> Vec<TrackedMessage> {
        self.messages.iter().map(|m| m.value().clone()).collect()
    }

    async fn sweep(&self, max_age: Duration) -> usize {
        let stale: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|m| m.value().created_at.elapsed() > max_age)
            .map(|m| *m.key())
            .collect();

        for message_id in &stale {
            if let Some(message) = self.messages.get(message_id).map(|m| m.clone()) {
                self.cancel_timers(*message_id);
                self.messages.remove(message_id);
                self.dispatch
                    .emit_event(LifecycleEvent {
                        topic: "delivery.failed".to_string(),
                        relevant_agents: HashSet::from([message.from]),
                        payload: json!({ "messageId": message_id.to_string(), "reason": "stale" }),
                    })
                    .await;
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::event_bus::EventBusImpl;
    use crate::hub::registry::InstanceRegistryImpl;
    use crate::hub::session::SessionTable;
    use crate::hub::dispatch::DispatchFabricImpl;

    fn test_engine() -> Arc<DeliveryEngineImpl> {
        let registry = Arc::new(InstanceRegistryImpl::new());
        let event_bus: Arc<dyn crate::hub::traits::EventBus> = Arc::new(EventBusImpl::new());
        let dispatch: Arc<dyn DispatchFabric> = Arc::new(DispatchFabricImpl::new(
            SessionTable::new(),
            event_bus,
        ));
        DeliveryEngineImpl::new(registry, dispatch, HubConfig::default())
    }

    #[tokio::test]
    async fn send_to_single_recipient_is_a2a_with_no_recipient_state() {
        let engine = test_engine();
        let message = DeliveryEngine::send(
            &engine,
            AgentId::generate(),
            SendTarget::Single(AgentId::generate()),
            json!("hello"),
            SendOptions::default(),
        )
        .await
        .expect("send should succeed");

        assert_eq!(message.delivery_mode, DeliveryMode::A2A);
        assert!(message.recipient_state.is_none());
        assert!(message.requires_ack);
    }

    #[tokio::test]
    async fn confirmation_with_wrong_depth_is_rejected() {
        let engine = test_engine();
        let options = SendOptions {
            message_type: Some(MessageType::Confirmation),
            confirmation_chain_depth: Some(2),
            ..Default::default()
        };
        let result = DeliveryEngine::send(
            &engine,
            AgentId::generate(),
            SendTarget::Single(AgentId::generate()),
            json!({}),
            options,
        )
        .await;
        assert!(matches!(result, Err(DeliveryError::ConfirmationLoopRejected)));
    }

    #[tokio::test]
    async fn confirmation_with_depth_one_is_accepted() {
        let engine = test_engine();
        let options = SendOptions {
            message_type: Some(MessageType::Confirmation),
            confirmation_chain_depth: Some(1),
            ..Default::default()
        };
        let result = DeliveryEngine::send(
            &engine,
            AgentId::generate(),
            SendTarget::Single(AgentId::generate()),
            json!({}),
            options,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn empty_a2ma_recipient_set_is_rejected() {
        let engine = test_engine();
        let result = DeliveryEngine::send(
            &engine,
            AgentId::generate(),
            SendTarget::Set(HashSet::new()),
            json!({}),
            SendOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(DeliveryError::EmptyRecipientSet)));
    }

    #[tokio::test]
    async fn process_ack_on_unknown_message_is_a_no_op() {
        let engine = test_engine();
        DeliveryEngine::process_ack(
            &engine,
            MessageId::generate(),
            AckKind::Delivery,
            AgentId::generate(),
            crate::hub::domain_types::InstanceId::try_new("x".to_string()).unwrap(),
        )
        .await;
    }
}
