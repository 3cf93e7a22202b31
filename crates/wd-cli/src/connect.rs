//! `wd connect`

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::bootstrap;

#[derive(Args)]
pub struct ConnectArgs {
    /// Workspace id
    #[arg(value_name = "ID")]
    pub id: i64,

    /// Control-plane address for lifecycle feedback
    #[arg(long = "callback-api-address")]
    pub callback_api_address: Option<String>,
}

impl ConnectArgs {
    pub async fn run(self) -> Result<()> {
        let orchestrator = bootstrap::orchestrator(self.callback_api_address.as_deref())?;
        let outcome = orchestrator.connect(self.id).await?;

        for binding in &outcome.bindings {
            info!(
                "  {:<16} {}:{} -> localhost:{}",
                binding.label, binding.service, binding.container_port, binding.client_port
            );
        }
        if let Some(url) = &outcome.web_ide_url {
            info!("open {}", url);
        }
        if let Some(tunnels) = outcome.tunnels {
            info!("tunnels up, press ctrl-c to disconnect");
            let _ = tokio::signal::ctrl_c().await;
            tunnels.shutdown().await;
        }
        Ok(())
    }
}
