//! The driver contract every substrate implements.

use std::time::Duration;

use async_trait::async_trait;

use wd_config::EffectiveConfig;
use wd_workspace::{PortBinding, WorkspaceDescriptor};

use crate::runner::CommandRunner;
use crate::{Result, SubstrateError};

/// Workload status as the substrate reports it.
#[derive(Debug, Clone)]
pub struct SubstrateStatus {
    pub running: bool,
    pub detail: String,
}

/// Capability set of a substrate. Three live implementations (local,
/// SSH-remote, Kubernetes) plus the scripted fake used in tests.
#[async_trait]
pub trait SubstrateDriver: Send + Sync {
    fn id(&self) -> &'static str;

    /// Verify prerequisites; install what the driver owns (kubectl).
    async fn ensure_ready(&self) -> Result<()>;

    /// Ports already listening on the substrate host, for collision-free
    /// allocation. `None` means the caller probes by binding locally.
    async fn host_ports_in_use(&self) -> Result<Option<Vec<u16>>>;

    /// Check the sources out at the descriptor's working directory.
    /// Idempotent: clone once, fetch afterwards.
    async fn materialize_sources(&self, desc: &WorkspaceDescriptor) -> Result<()>;

    /// Place the runtime manifest at its stable per-workspace path.
    /// Returns the path written.
    async fn write_manifest(&self, desc: &WorkspaceDescriptor) -> Result<String>;

    /// Bring the workload up and report its substrate-side port bindings.
    async fn up(
        &self,
        desc: &WorkspaceDescriptor,
        effective: &EffectiveConfig,
    ) -> Result<Vec<PortBinding>>;

    /// Stop the workload without destroying state.
    async fn down(&self, desc: &WorkspaceDescriptor) -> Result<()>;

    /// Destroy containers/pods; keep the checkout unless purging.
    async fn remove(&self, desc: &WorkspaceDescriptor, purge: bool) -> Result<()>;

    async fn status(&self, desc: &WorkspaceDescriptor) -> Result<SubstrateStatus>;

    /// Poll the IDE endpoint (client side) until HTTP 200 or timeout.
    async fn wait_healthy(&self, port: u16, deadline: Duration) -> Result<()>;
}

/// Fail with a named prerequisite unless every tool answers `command -v`.
pub async fn ensure_tools(runner: &dyn CommandRunner, tools: &[&str]) -> Result<()> {
    for tool in tools {
        let output = runner.run(&format!("command -v {}", tool)).await?;
        if !output.success() {
            return Err(SubstrateError::MissingPrerequisite(format!(
                "{} not found on substrate",
                tool
            )));
        }
    }
    Ok(())
}

/// Parse `ss -ltn` / `netstat -ltn` style output into listening ports.
pub fn parse_listening_ports(output: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = output
        .lines()
        .filter_map(|line| {
            // local address column looks like 0.0.0.0:3000, [::]:3000 or *:3000
            line.split_whitespace()
                .find(|col| col.contains(':'))
                .and_then(|col| col.rsplit(':').next())
                .and_then(|port| port.parse().ok())
        })
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedRunner;

    #[tokio::test]
    async fn ensure_tools_names_the_missing_one() {
        let runner = ScriptedRunner::new()
            .on("command -v git", "/usr/bin/git")
            .on_failure("command -v docker-compose", 127, "");
        let err = ensure_tools(&runner, &["git", "docker-compose"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("docker-compose"));
    }

    #[test]
    fn listening_ports_parse_ss_output() {
        let output = "State   Recv-Q  Send-Q  Local Address:Port  Peer Address:Port\n\
                      LISTEN  0       128     0.0.0.0:3000        0.0.0.0:*\n\
                      LISTEN  0       128     [::]:22             [::]:*\n";
        assert_eq!(parse_listening_ports(output), vec![22, 3000]);
    }
}
