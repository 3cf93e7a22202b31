//! `wd stop`

use anyhow::Result;
use tracing::info;

use crate::bootstrap;
use crate::target::TargetArgs;

pub async fn run(args: TargetArgs) -> Result<()> {
    let orchestrator = bootstrap::orchestrator(None)?;
    let desc = orchestrator.stop(args.to_input()?).await?;
    info!(
        id = desc.id.unwrap_or_default(),
        name = %desc.name,
        "workspace stopped"
    );
    Ok(())
}
