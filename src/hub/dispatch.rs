//! C3 — Dispatch Fabric: the only component permitted to hold transport
//! references inside the engine's call paths, keeping the delivery engine
//! pure.

use crate::hub::domain_types::{Envelope, LifecycleEvent};
use crate::hub::push_server::ServerFrame;
use crate::hub::session::SessionTable;
use crate::hub::traits::{DispatchError, DispatchFabric, EventBus};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// The default [`DispatchFabric`] implementation: translates engine
/// callbacks into session-table writes and event-bus publications.
pub struct DispatchFabricImpl {
    sessions: SessionTable,
    event_bus: Arc<dyn EventBus>,
}

impl DispatchFabricImpl {
    /// Builds a dispatch fabric over a shared session table and event bus.
    #[must_use]
    pub fn new(sessions: SessionTable, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            sessions,
            event_bus,
        }
    }
}

#[async_trait]
impl DispatchFabric for DispatchFabricImpl {
    async fn emit_deliver(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let (agent_id, instance_id) = envelope.to_instance.clone();
        let frame = ServerFrame::MessageReceived {
            message_id: envelope.message_id,
            from: envelope.from,
            content: envelope.payload,
            priority: envelope.priority,
            metadata: envelope.metadata,
            requires_ack: envelope.flags.requires_ack,
            requires_read_receipt: envelope.flags.requires_read_receipt,
        };

        let result = self
            .sessions
            .send_to(agent_id.clone(), instance_id.clone(), frame);
        if let Err(ref err) = result {
            warn!(%agent_id, %instance_id, %err, "dispatch failed to deliver envelope");
        }
        result
    }

    async fn emit_event(&self, event: LifecycleEvent) {
        let relevant_agents = event.relevant_agents.clone();
        let frame = ServerFrame::Lifecycle {
            topic: event.topic.clone(),
            payload: event.payload.clone(),
        };

        self.event_bus.publish(event);
        self.sessions.broadcast(&relevant_agents, frame).await;
    }
}
