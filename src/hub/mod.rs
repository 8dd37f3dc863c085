//! The message hub: instance registry (C1), delivery engine (C2), dispatch
//! fabric (C3), push server (C4), event bus (C5), and the facade (C6) that
//! composes them.
//!
//! Submodules mirror the component split in the design: each owns its own
//! domain types, trait contract, and default implementation, wired together
//! only by [`facade::Hub`].

pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod domain_types;
pub mod event_bus;
pub mod facade;
pub mod push_server;
pub mod registry;
pub mod session;
pub mod traits;

pub use config::HubConfig;
pub use facade::Hub;
pub use traits::{HubHealth, HubStats};
