//! `wd start`

use anyhow::Result;
use clap::{Args, ValueEnum};
use tracing::info;

use wd_core::{ProgressEvent, RunMode, StartOptions};

use crate::bootstrap;
use crate::target::TargetArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliMode {
    #[default]
    Client,
    Server,
    Pipeline,
}

impl From<CliMode> for RunMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Client => RunMode::Client,
            CliMode::Server => RunMode::Server,
            CliMode::Pipeline => RunMode::Pipeline,
        }
    }
}

#[derive(Args)]
pub struct StartArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Invocation mode; server and pipeline runs return right after launch
    #[arg(long = "mode", value_enum, default_value_t = CliMode::Client)]
    pub mode: CliMode,

    /// Control-plane address for lifecycle feedback
    #[arg(long = "callback-api-address")]
    pub callback_api_address: Option<String>,

    /// Skip port forwarding
    #[arg(long = "unforward")]
    pub unforward: bool,

    /// Assume sources are already present on the substrate
    #[arg(long = "disable-clone")]
    pub disable_clone: bool,
}

impl StartArgs {
    pub async fn run(self) -> Result<()> {
        let orchestrator = bootstrap::orchestrator(self.callback_api_address.as_deref())?
            .with_progress(Box::new(|event| {
                if let ProgressEvent::StageStarted { stage } = event {
                    info!("==> {}", stage);
                }
            }));

        // user interrupt propagates as cancellation into the running stage
        let cancel = orchestrator.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let opts = StartOptions {
            unforward: self.unforward,
            disable_clone: self.disable_clone,
            run_mode: self.mode.into(),
        };
        let outcome = orchestrator.start(self.target.to_input()?, &opts).await?;

        let id = outcome.descriptor.id.unwrap_or_default();
        info!(id, name = %outcome.descriptor.name, "workspace is running");
        for binding in &outcome.bindings {
            info!(
                "  {:<16} {}:{} -> localhost:{}",
                binding.label, binding.service, binding.container_port, binding.client_port
            );
        }
        if let Some(url) = &outcome.web_ide_url {
            info!("open {}", url);
        }

        // client mode keeps the forwards alive until the user interrupts
        if let Some(tunnels) = outcome.tunnels {
            info!("tunnels up, press ctrl-c to disconnect");
            let _ = tokio::signal::ctrl_c().await;
            tunnels.shutdown().await;
        }
        if let Some(port_forward) = outcome.port_forward {
            info!("port-forward up, press ctrl-c to disconnect");
            let _ = tokio::signal::ctrl_c().await;
            port_forward.abort();
        }
        Ok(())
    }
}
