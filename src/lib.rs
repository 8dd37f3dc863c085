//! # agent-hub
//!
//! A centralized, guaranteed-delivery message hub for multi-agent
//! collaboration. Agents connect over a WebSocket push transport, register
//! under a logical `agentId`, and exchange messages the hub tracks through
//! a `pending → sent → delivered → acknowledged → read` lifecycle with
//! automatic retry, ack timeouts, and idempotent duplicate-ack handling.
//!
//! ## Architecture
//!
//! The hub is composed of five cooperating components, each with its own
//! module under [`hub`]:
//!
//! - **Instance Registry** ([`hub::registry`]) — resolves a logical agent
//!   id to its currently online instances.
//! - **Delivery Engine** ([`hub::delivery`]) — owns the lifecycle of every
//!   in-flight tracked message: attempts, retries, ack timers, and
//!   confirmation synthesis.
//! - **Dispatch Fabric** ([`hub::dispatch`]) — the only component
//!   permitted to hold transport references, translating engine callbacks
//!   into session-table writes and event-bus publications.
//! - **Push Server** ([`hub::push_server`]) — the WebSocket transport and
//!   wire protocol.
//! - **Event Bus** ([`hub::event_bus`]) — synchronous, non-blocking
//!   in-process publish/subscribe for lifecycle events.
//!
//! [`hub::Hub`] is the facade composing all five; most embedders only need
//! to construct a [`hub::HubConfig`] and call [`hub::Hub::start`].

pub mod domain_types;
pub mod error;
pub mod hub;

pub use error::HubError;
pub use hub::{Hub, HubConfig, HubHealth, HubStats};
