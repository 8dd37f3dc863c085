//! Top-level error type aggregating every component's error enum.
//!
//! Mirrors the split used for the router elsewhere in this codebase: each
//! component raises its own `thiserror` enum (see [`crate::hub::traits`]
//! and [`crate::hub::config`]), and [`HubError`] wraps them with `#[from]`
//! so call sites that cross component boundaries (the facade, the
//! binaries) can use a single `?`-compatible error type. `main.rs` and
//! `hubctl.rs` flatten this into `anyhow::Result` at the process boundary.

use crate::hub::config::ConfigError;
use crate::hub::traits::{DeliveryError, DispatchError, MemoryStoreError, PushServerError, RegistryError};
use thiserror::Error;

/// Aggregate error type for hub operations that can fail across more than
/// one component.
#[derive(Debug, Error)]
pub enum HubError {
    /// A configuration value failed validation or could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The instance registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The delivery engine rejected a send or ack.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// The dispatch fabric could not reach a target session.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// The push server received or produced a malformed frame.
    #[error("push server error: {0}")]
    PushServer(#[from] PushServerError),

    /// The external memory-store collaborator reported a failure.
    #[error("memory store error: {0}")]
    MemoryStore(#[from] MemoryStoreError),

    /// Binding or serving the push server's listener failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
