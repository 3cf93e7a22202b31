//! `wd list`

use anyhow::Result;
use clap::Args;

use crate::bootstrap;

#[derive(Args)]
pub struct ListArgs {
    /// Include removed workspaces
    #[arg(long = "all", short = 'a')]
    pub all: bool,
}

impl ListArgs {
    pub async fn run(self) -> Result<()> {
        let orchestrator = bootstrap::orchestrator(None)?;
        let mut workspaces = orchestrator.list()?;
        if self.all {
            workspaces.extend(orchestrator.registry().list_deleted()?);
        }

        println!(
            "{:<6} {:<20} {:<8} {:<18} {}",
            "ID", "NAME", "MODE", "STATE", "GIT"
        );
        for ws in workspaces {
            println!(
                "{:<6} {:<20} {:<8} {:<18} {}",
                ws.id.unwrap_or_default(),
                ws.name,
                ws.mode,
                ws.extend.state.to_string(),
                ws.git_url
            );
        }
        Ok(())
    }
}
