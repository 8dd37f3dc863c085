//! `hubctl` — a thin CLI for starting and inspecting an agent-hub server.

use agent_hub::hub::config::PushPort;
use agent_hub::{Hub, HubConfig};
use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Starts and configures the agent-hub message hub.
#[derive(Debug, Parser)]
#[command(name = "hubctl", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Port the push server listens on.
    #[arg(long)]
    push_port: Option<u16>,

    /// Path to a JSON configuration file. Overridden by any flag given
    /// alongside it.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Disables the guaranteed-delivery state machine, falling back to
    /// best-effort delivery without tracking.
    #[arg(long)]
    no_enhanced: bool,

    /// URL of an external memory-store archive to forward message content
    /// and lifecycle audit trails to. Accepted for interface compatibility;
    /// the core only consumes a [`agent_hub::hub::traits::MemoryStore`]
    /// collaborator passed in by an embedder, so a bare CLI run without one
    /// configured still starts the hub and simply skips archiving.
    #[arg(long)]
    archive_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut builder = match &cli.config {
        Some(path) => {
            info!(?path, "loading base configuration from file");
            let loaded = HubConfig::load_from_file(path)?;
            HubConfig::builder()
                .push_port(loaded.push_port)
                .delivery_timeout_ms(loaded.delivery_timeout_ms)
                .ack_timeout_ms(loaded.ack_timeout_ms)
                .max_retries(loaded.max_retries)
                .base_backoff_ms(loaded.base_backoff_ms)
                .heartbeat_timeout_ms(loaded.heartbeat_timeout_ms)
                .sweeper_interval_ms(loaded.sweeper_interval_ms)
                .eviction_age_ms(loaded.eviction_age_ms)
                .enhanced(loaded.enhanced)
        }
        None => HubConfig::builder(),
    };

    if let Some(port) = cli.push_port {
        builder = builder.push_port(PushPort::try_new(port)?);
    }
    if cli.no_enhanced {
        builder = builder.enhanced(false);
    }
    if let Some(url) = &cli.archive_url {
        info!(%url, "archive URL configured; note this core does not ship a MemoryStore adapter");
    }

    let config = builder.build()?;
    let hub = Hub::new(config);
    hub.start().await
}
