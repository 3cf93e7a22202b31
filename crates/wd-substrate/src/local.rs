//! Driver for workspaces on the local host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use wd_config::EffectiveConfig;
use wd_workspace::{PortBinding, WorkspaceDescriptor};

use crate::docker;
use crate::driver::{ensure_tools, SubstrateDriver, SubstrateStatus};
use crate::health;
use crate::runner::CommandRunner;
use crate::sources;
use crate::Result;

/// Local Docker Compose substrate.
pub struct LocalDriver {
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl LocalDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, cancel: CancellationToken) -> Self {
        Self { runner, cancel }
    }
}

#[async_trait]
impl SubstrateDriver for LocalDriver {
    fn id(&self) -> &'static str {
        "local"
    }

    async fn ensure_ready(&self) -> Result<()> {
        ensure_tools(self.runner.as_ref(), &["git", "docker", "docker-compose"]).await
    }

    async fn host_ports_in_use(&self) -> Result<Option<Vec<u16>>> {
        // substrate host == client host; the caller's bind probe is exact
        Ok(None)
    }

    async fn materialize_sources(&self, desc: &WorkspaceDescriptor) -> Result<()> {
        sources::materialize(self.runner.as_ref(), desc, None).await
    }

    async fn write_manifest(&self, desc: &WorkspaceDescriptor) -> Result<String> {
        let path = desc.manifest_path();
        self.runner
            .write_file(&path, desc.manifest_content.as_bytes(), None)
            .await?;
        Ok(path)
    }

    async fn up(
        &self,
        desc: &WorkspaceDescriptor,
        effective: &EffectiveConfig,
    ) -> Result<Vec<PortBinding>> {
        let mut bindings = docker::up_flow(self.runner.as_ref(), desc, effective).await?;
        // no tunnel hop locally; the client reaches host ports directly
        for binding in &mut bindings {
            binding.client_port = binding.current_host_port;
        }
        Ok(bindings)
    }

    async fn down(&self, desc: &WorkspaceDescriptor) -> Result<()> {
        docker::down_flow(self.runner.as_ref(), desc).await
    }

    async fn remove(&self, desc: &WorkspaceDescriptor, purge: bool) -> Result<()> {
        docker::remove_flow(self.runner.as_ref(), desc, purge).await
    }

    async fn status(&self, desc: &WorkspaceDescriptor) -> Result<SubstrateStatus> {
        docker::status_flow(self.runner.as_ref(), desc).await
    }

    async fn wait_healthy(&self, port: u16, deadline: Duration) -> Result<()> {
        health::wait_http_ok("127.0.0.1", port, deadline, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedRunner;
    use std::collections::BTreeMap;
    use wd_config::{resolver, ManifestTarget, ResolveInput, RuntimeManifest};
    use wd_workspace::{GitAuth, WorkspaceExtend, WorkspaceMode};

    const CONFIG: &str = r#"
workspace:
  dev-container:
    service-name: web
    ports:
      webide: 6800
      web: 3000
  services:
    web:
      image: registry.example.com/web:latest
"#;

    fn desc_with_manifest() -> (WorkspaceDescriptor, EffectiveConfig) {
        let prior = BTreeMap::new();
        let resolved = resolver::resolve(
            &ResolveInput {
                config_text: CONFIG,
                link_compose_text: None,
                working_dir: "/tmp/workspaces/1",
                user_name: "dev",
                prior_ports: &prior,
                target: ManifestTarget::Compose {
                    project: "wd1".into(),
                },
            },
            &|_: u16| true,
        )
        .unwrap();
        let manifest = match &resolved.manifest {
            RuntimeManifest::Compose(c) => c.to_yaml().unwrap(),
            RuntimeManifest::K8s(_) => unreachable!(),
        };
        let desc = WorkspaceDescriptor {
            id: Some(1),
            name: "example".into(),
            mode: WorkspaceMode::Local,
            working_dir: "/tmp/workspaces/1".into(),
            git_url: "https://example.com/example.git".into(),
            branch: "main".into(),
            git_auth: GitAuth::Public,
            git_username: None,
            git_secret: None,
            config_path: ".ide/config.yaml".into(),
            config_content: CONFIG.into(),
            link_compose_content: String::new(),
            manifest_content: manifest,
            extend: WorkspaceExtend::default(),
            remote: None,
            cluster: None,
            created_at: None,
        };
        (desc, resolved.effective)
    }

    #[tokio::test]
    async fn up_creates_network_then_composes_and_maps_client_ports() {
        let (desc, effective) = desc_with_manifest();
        let runner = Arc::new(ScriptedRunner::new());
        let driver = LocalDriver::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, CancellationToken::new());

        driver.write_manifest(&desc).await.unwrap();
        let bindings = driver.up(&desc, &effective).await.unwrap();

        let commands = runner.commands();
        let net_pos = commands
            .iter()
            .position(|c| c.contains("docker network create"))
            .expect("network created");
        let up_pos = commands
            .iter()
            .position(|c| c.contains("docker-compose") && c.contains("up -d"))
            .expect("compose up ran");
        assert!(net_pos < up_pos);

        let web = bindings.iter().find(|b| b.label == "web").unwrap();
        assert_eq!(web.current_host_port, 3000);
        assert_eq!(web.client_port, 3000);
    }

    #[tokio::test]
    async fn up_reconciles_against_docker_ps() {
        let (desc, effective) = desc_with_manifest();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("docker ps", "wd1-web 0.0.0.0:3005->3000/tcp\n"),
        );
        let driver = LocalDriver::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, CancellationToken::new());

        let bindings = driver.up(&desc, &effective).await.unwrap();
        let web = bindings.iter().find(|b| b.label == "web").unwrap();
        assert_eq!(web.current_host_port, 3005);
    }

    #[tokio::test]
    async fn missing_docker_fails_ensure_ready() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("command -v git", "/usr/bin/git")
                .on_failure("command -v docker", 127, ""),
        );
        let driver = LocalDriver::new(runner as Arc<dyn CommandRunner>, CancellationToken::new());
        assert!(driver.ensure_ready().await.is_err());
    }

    #[tokio::test]
    async fn remove_with_purge_deletes_checkout() {
        let (desc, _) = desc_with_manifest();
        let runner = Arc::new(ScriptedRunner::new());
        let driver = LocalDriver::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, CancellationToken::new());

        driver.remove(&desc, true).await.unwrap();
        assert_eq!(runner.count_matching("down"), 1);
        assert_eq!(runner.count_matching("rm -rf"), 1);
    }
}
