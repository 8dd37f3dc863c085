//! agent-hub — the message hub server binary.

use agent_hub::{Hub, HubConfig};
use anyhow::Result;
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agent_hub=info".parse()?),
        )
        .init();

    let config = match env::var("AGENT_HUB_CONFIG") {
        Ok(path) => {
            info!(%path, "loading configuration from file");
            HubConfig::load_from_file(path)?
        }
        Err(_) => HubConfig::default(),
    };

    info!(
        push_port = %config.push_port,
        enhanced = config.enhanced,
        "starting agent-hub"
    );

    let hub = Hub::new(config);
    hub.start().await
}
