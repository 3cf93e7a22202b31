//! `wd remove`

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::bootstrap;
use crate::target::TargetArgs;

#[derive(Args)]
pub struct RemoveArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Also delete the Git checkout on the substrate
    #[arg(long = "purge")]
    pub purge: bool,
}

impl RemoveArgs {
    pub async fn run(self) -> Result<()> {
        let orchestrator = bootstrap::orchestrator(None)?;
        orchestrator
            .remove(self.target.to_input()?, self.purge)
            .await?;
        info!("workspace removed");
        Ok(())
    }
}
