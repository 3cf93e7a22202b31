//! Driver for workspaces in a Kubernetes namespace.
//!
//! Talks to the cluster through an external pinned `kubectl` binary rather
//! than a client library, keeping API-version coupling out of the engine.
//! Every invocation carries the same flag set: kubeconfig, context,
//! namespace.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wd_config::EffectiveConfig;
use wd_workspace::{ClusterRef, Kubeconfig, PortBinding, WorkspaceDescriptor};

use crate::driver::{SubstrateDriver, SubstrateStatus};
use crate::health;
use crate::runner::{shell_quote, CommandRunner};
use crate::sources;
use crate::{Result, SubstrateError};

/// kubectl client version installed when absent.
pub const KUBECTL_VERSION: &str = "v1.23.9";

/// Attempts at drawing an unused random namespace name.
const NAMESPACE_ATTEMPTS: u32 = 10;

/// Flags and namespace fixed by `ensure_ready` for the whole operation.
#[derive(Debug, Clone)]
struct K8sSession {
    flags: String,
    namespace: String,
}

/// Kubernetes substrate.
pub struct K8sDriver {
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
    cluster: ClusterRef,
    home: String,
    session: Mutex<Option<K8sSession>>,
    agent_binary: Option<Vec<u8>>,
}

impl K8sDriver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
        cluster: ClusterRef,
        home: String,
    ) -> Self {
        Self {
            runner,
            cancel,
            cluster,
            home,
            session: Mutex::new(None),
            agent_binary: None,
        }
    }

    pub fn with_agent_binary(mut self, binary: Vec<u8>) -> Self {
        self.agent_binary = Some(binary);
        self
    }

    fn kubectl_path(&self) -> String {
        format!("{}/.workdock/kubectl", self.home)
    }

    /// Namespace in effect after `ensure_ready`; generated when the cluster
    /// ref had none.
    pub fn namespace(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.namespace.clone())
    }

    fn session(&self) -> Result<K8sSession> {
        self.session
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SubstrateError::Validation("driver used before ensure_ready".into()))
    }

    fn kubectl(&self, session: &K8sSession, args: &str) -> String {
        format!("{} {} {}", self.kubectl_path(), session.flags, args)
    }

    async fn run_kubectl(&self, session: &K8sSession, args: &str) -> Result<crate::RunOutput> {
        let command = self.kubectl(session, args);
        debug!(command, "kubectl");
        self.runner.run(&command).await
    }

    async fn install_kubectl_if_missing(&self) -> Result<()> {
        let path = self.kubectl_path();
        if self.runner.file_exists(&path).await? {
            return Ok(());
        }
        info!(version = KUBECTL_VERSION, path, "installing kubectl");
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        let url = format!(
            "https://dl.k8s.io/release/{}/bin/{}/{}/kubectl",
            KUBECTL_VERSION, os, arch
        );
        let command = format!(
            "mkdir -p {dir} && curl -fsSL -o {path} {url} && chmod +x {path}",
            dir = shell_quote(&format!("{}/.workdock", self.home)),
            path = shell_quote(&path),
            url = shell_quote(&url),
        );
        self.runner.run(&command).await?.ensure_success(&command)?;
        Ok(())
    }

    /// Resolve kubeconfig flags; inline content is materialized write-once.
    async fn kubeconfig_flags(&self) -> Result<String> {
        match &self.cluster.kubeconfig {
            Some(Kubeconfig::Path(path)) => {
                let absolute = if let Some(rest) = path.strip_prefix("~/") {
                    format!("{}/{}", self.home, rest)
                } else {
                    path.clone()
                };
                if !self.runner.file_exists(&absolute).await? {
                    return Err(SubstrateError::Validation(format!(
                        "kubeconfig {} does not exist",
                        absolute
                    )));
                }
                Ok(format!("--kubeconfig {} ", shell_quote(&absolute)))
            }
            Some(Kubeconfig::Inline(content)) => {
                let path = format!("{}/.kube/config_workdock", self.home);
                self.runner
                    .write_file(&path, content.as_bytes(), Some(0o600))
                    .await?;
                Ok(format!("--kubeconfig {} ", shell_quote(&path)))
            }
            None => Ok(String::new()),
        }
    }

    /// Pick (or verify) the namespace, generating a random 6-letter name
    /// when the cluster ref has none.
    async fn ensure_namespace(&self, flags: &str) -> Result<String> {
        if let Some(ns) = self
            .cluster
            .namespace
            .as_ref()
            .filter(|ns| !ns.trim().is_empty())
        {
            let command = format!(
                "{} {}get namespace {ns} >/dev/null 2>&1 || {} {}create namespace {ns}",
                self.kubectl_path(),
                flags,
                self.kubectl_path(),
                flags,
                ns = ns,
            );
            self.runner.run(&command).await?.ensure_success(&command)?;
            return Ok(ns.clone());
        }

        for _ in 0..NAMESPACE_ATTEMPTS {
            let candidate = random_namespace();
            let command = format!("{} {}get namespace {}", self.kubectl_path(), flags, candidate);
            let output = self.runner.run(&command).await?;
            if output.success() {
                // name exists, draw again
                continue;
            }
            if output.stderr.contains("not found") || output.stdout.contains("not found") {
                let command = format!(
                    "{} {}create namespace {}",
                    self.kubectl_path(),
                    flags,
                    candidate
                );
                self.runner.run(&command).await?.ensure_success(&command)?;
                return Ok(candidate);
            }
            // transient probe failure is not fatal, try another name
            warn!(stderr = %output.stderr.trim(), "namespace probe failed, retrying");
        }
        Err(SubstrateError::Validation(
            "could not allocate an unused namespace".into(),
        ))
    }

    fn manifest_path_for(&self, desc: &WorkspaceDescriptor) -> String {
        format!(
            "{}/.workdock/manifests/ws-{}.yaml",
            self.home,
            desc.id.unwrap_or_default()
        )
    }

    async fn dev_pod_name(&self, session: &K8sSession, effective: &EffectiveConfig) -> Result<String> {
        let args = format!(
            "get pods -l app={} -o jsonpath={{.items[0].metadata.name}}",
            effective.dev_service
        );
        let output = self.run_kubectl(session, &args).await?;
        let output = output.ensure_success(&args)?;
        let pod = output.stdout.trim().to_string();
        if pod.is_empty() {
            return Err(SubstrateError::Validation(format!(
                "no pod found for app={}",
                effective.dev_service
            )));
        }
        Ok(pod)
    }

    async fn exec_in_pod(
        &self,
        session: &K8sSession,
        pod: &str,
        container: &str,
        command: &str,
        run_as_user: Option<&str>,
    ) -> Result<crate::RunOutput> {
        let wrapped = wrap_run_as(command, run_as_user);
        let args = format!(
            "exec {} -c {} -- sh -c {}",
            pod,
            container,
            shell_quote(&wrapped)
        );
        self.run_kubectl(session, &args).await
    }

    async fn copy_to_pod(
        &self,
        session: &K8sSession,
        local_path: &str,
        pod: &str,
        dest_path: &str,
    ) -> Result<()> {
        let args = format!(
            "cp {} {}/{}:{}",
            shell_quote(local_path),
            session.namespace,
            pod,
            dest_path
        );
        let command = self.kubectl(session, &args);
        self.runner.run(&command).await?.ensure_success(&command)?;
        Ok(())
    }

    /// Command line for `kubectl port-forward`; the caller supervises the
    /// long-running child.
    pub fn port_forward_command(&self, dev_service: &str, pairs: &[(u16, u16)]) -> Result<String> {
        let session = self.session()?;
        let mapping: Vec<String> = pairs
            .iter()
            .map(|(client, service)| format!("{}:{}", client, service))
            .collect();
        Ok(self.kubectl(
            &session,
            &format!("port-forward service/{} {}", dev_service, mapping.join(" ")),
        ))
    }
}

/// Non-root commands run as the configured user; single quotes inside the
/// command are doubled.
fn wrap_run_as(command: &str, run_as_user: Option<&str>) -> String {
    match run_as_user {
        Some(user) if !user.is_empty() && user != "root" => {
            format!("su {} -c '{}'", user, command.replace('\'', "''"))
        }
        _ => command.to_string(),
    }
}

fn random_namespace() -> String {
    let mut rng = rand::thread_rng();
    (0..6).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Kind/name pairs of every object in a multi-document manifest.
fn manifest_objects(manifest: &str) -> Vec<(String, String)> {
    manifest
        .split("\n---")
        .filter_map(object_kind_and_name)
        .collect()
}

fn object_kind_and_name(doc: &str) -> Option<(String, String)> {
    // cheap line scan; the manifest is our own output
    let mut kind = None;
    let mut name = None;
    let mut in_metadata = false;
    for line in doc.lines() {
        if let Some(k) = line.strip_prefix("kind: ") {
            kind = Some(k.trim().to_string());
        }
        if line.starts_with("metadata:") {
            in_metadata = true;
            continue;
        }
        if in_metadata {
            if !line.starts_with(' ') {
                in_metadata = false;
            } else if let Some(n) = line.trim_start().strip_prefix("name: ") {
                if name.is_none() {
                    name = Some(n.trim().to_string());
                }
            }
        }
    }
    Some((kind?, name?))
}

#[async_trait]
impl SubstrateDriver for K8sDriver {
    fn id(&self) -> &'static str {
        "k8s"
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.install_kubectl_if_missing().await?;

        let mut flags = self.kubeconfig_flags().await?;

        // switch context only when the kubeconfig default differs
        let command = format!("{} {}config current-context", self.kubectl_path(), flags);
        let output = self.runner.run(&command).await?;
        if !output.success() || output.stdout.trim() != self.cluster.context {
            flags.push_str(&format!("--context {} ", shell_quote(&self.cluster.context)));
        }

        let command = format!("{} {}get nodes", self.kubectl_path(), flags);
        let output = self.runner.run(&command).await?;
        if !output.success() || output.stdout.contains("Unable to connect") {
            return Err(SubstrateError::MissingPrerequisite(format!(
                "cluster {} unreachable: {}",
                self.cluster.context,
                output.stderr.trim()
            )));
        }

        let namespace = self.ensure_namespace(&flags).await?;
        flags.push_str(&format!("--namespace {} ", namespace));

        *self.session.lock().unwrap() = Some(K8sSession { flags, namespace });
        Ok(())
    }

    async fn host_ports_in_use(&self) -> Result<Option<Vec<u16>>> {
        // service ports live cluster-side; nothing collides on the client
        Ok(Some(Vec::new()))
    }

    async fn materialize_sources(&self, _desc: &WorkspaceDescriptor) -> Result<()> {
        // sources are cloned into the dev pod once it is running; `up`
        // drives that, there is no host checkout on this substrate
        debug!("k8s sources materialize deferred until the pod is ready");
        Ok(())
    }

    async fn write_manifest(&self, desc: &WorkspaceDescriptor) -> Result<String> {
        let path = self.manifest_path_for(desc);
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
        let session = self.session()?;
        let path = self.manifest_path_for(desc);

        let args = format!("apply -f {}", shell_quote(&path));
        let command = self.kubectl(&session, &args);
        self.runner.run(&command).await?.ensure_success(&command)?;

        // wait for the dev container deployment to come up
        let args = format!(
            "rollout status deployment/{} --timeout=300s",
            effective.dev_service
        );
        let command = self.kubectl(&session, &args);
        self.runner.run(&command).await?.ensure_success(&command)?;

        let pod = self.dev_pod_name(&session, effective).await?;
        let run_as = effective.run_as_user.as_deref();

        // clone the sources inside the dev container; an empty branch means
        // the repository default
        let checkout = if desc.branch.is_empty() {
            String::new()
        } else {
            format!(" && git checkout {}", shell_quote(&desc.branch))
        };
        let branch_flag = if desc.branch.is_empty() {
            String::new()
        } else {
            format!("-b {} ", shell_quote(&desc.branch))
        };
        let clone = format!(
            "[ -d {dir}/.git ] && (cd {dir} && git fetch --prune{checkout}) || git clone {branch_flag}{url} {dir}",
            dir = shell_quote(&desc.working_dir),
            checkout = checkout,
            branch_flag = branch_flag,
            url = shell_quote(&sources::clone_url(desc)),
        );
        let output = self
            .exec_in_pod(&session, &pod, &effective.dev_service, &clone, run_as)
            .await?;
        if !output.success() {
            return Err(SubstrateError::command(
                "git clone in pod",
                output.exit_code,
                &output.stderr,
            ));
        }

        if let Some(binary) = &self.agent_binary {
            let staging = format!("/tmp/wd-agent-{}", desc.id.unwrap_or_default());
            self.runner.write_file(&staging, binary, Some(0o755)).await?;
            self.copy_to_pod(&session, &staging, &pod, "/wd-agent").await?;
            let output = self
                .exec_in_pod(&session, &pod, &effective.dev_service, "chmod +x /wd-agent", None)
                .await?;
            if !output.success() {
                warn!("agent chmod failed, continuing");
            }
        }

        // exposed Service ports are the substrate-side bindings
        Ok(effective
            .labeled_ports()
            .map(|p| PortBinding {
                service: p.service.clone(),
                container_port: p.container_port,
                current_host_port: p.host_port,
                client_port: 0,
                label: p.label.clone(),
            })
            .collect())
    }

    async fn down(&self, desc: &WorkspaceDescriptor) -> Result<()> {
        let session = self.session()?;
        for (kind, name) in manifest_objects(&desc.manifest_content) {
            if kind == "Deployment" {
                let args = format!("scale deployment/{} --replicas=0", name);
                let command = self.kubectl(&session, &args);
                self.runner.run(&command).await?.ensure_success(&command)?;
            }
        }
        Ok(())
    }

    async fn remove(&self, desc: &WorkspaceDescriptor, purge: bool) -> Result<()> {
        let session = self.session()?;
        let path = self.manifest_path_for(desc);
        let args = format!("delete -f {} --ignore-not-found", shell_quote(&path));
        let command = self.kubectl(&session, &args);
        self.runner.run(&command).await?.ensure_success(&command)?;

        if purge {
            let args = format!("delete namespace {}", session.namespace);
            let command = self.kubectl(&session, &args);
            self.runner.run(&command).await?.ensure_success(&command)?;
        }
        Ok(())
    }

    async fn status(&self, _desc: &WorkspaceDescriptor) -> Result<SubstrateStatus> {
        let session = self.session()?;
        let output = self.run_kubectl(&session, "get pods").await?;
        let running = output.success() && output.stdout.contains("Running");
        Ok(SubstrateStatus {
            running,
            detail: output.stdout.trim().to_string(),
        })
    }

    async fn wait_healthy(&self, port: u16, deadline: Duration) -> Result<()> {
        // reached through the port-forward on the client side
        health::wait_http_ok("127.0.0.1", port, deadline, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedRunner;
    use std::collections::BTreeMap;
    use wd_config::{resolve, ManifestTarget, ResolveInput, RuntimeManifest};
    use wd_workspace::{GitAuth, WorkspaceExtend, WorkspaceMode};

    const CONFIG: &str = r#"
workspace:
  dev-container:
    service-name: web
    ports:
      webide: 6800
    run-as-user: smartuser
  services:
    web:
      image: registry.example.com/web:latest
"#;

    fn cluster(namespace: Option<&str>) -> ClusterRef {
        ClusterRef {
            id: Some(1),
            context: "kind-dev".into(),
            namespace: namespace.map(String::from),
            kubeconfig: None,
        }
    }

    fn k8s_desc(namespace: &str) -> (WorkspaceDescriptor, EffectiveConfig) {
        let prior = BTreeMap::new();
        let resolved = resolve(
            &ResolveInput {
                config_text: CONFIG,
                link_compose_text: None,
                working_dir: "/home/project".into(),
                user_name: "dev",
                prior_ports: &prior,
                target: ManifestTarget::K8s {
                    namespace: namespace.into(),
                },
            },
            &|_: u16| true,
        )
        .unwrap();
        let manifest = match &resolved.manifest {
            RuntimeManifest::K8s(m) => m.to_yaml().unwrap(),
            RuntimeManifest::Compose(_) => unreachable!(),
        };
        let desc = WorkspaceDescriptor {
            id: Some(9),
            name: "example".into(),
            mode: WorkspaceMode::K8s,
            working_dir: "/home/project".into(),
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
            cluster: Some(cluster(Some(namespace))),
            created_at: None,
        };
        (desc, resolved.effective)
    }

    fn driver_with(runner: Arc<ScriptedRunner>, cluster: ClusterRef) -> K8sDriver {
        K8sDriver::new(
            runner as Arc<dyn CommandRunner>,
            CancellationToken::new(),
            cluster,
            "/home/dev".into(),
        )
    }

    #[tokio::test]
    async fn ensure_ready_installs_pinned_kubectl_when_absent() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("config current-context", "kind-dev")
                .on("get nodes", "node-1 Ready"),
        );
        let driver = driver_with(Arc::clone(&runner), cluster(Some("dev")));
        driver.ensure_ready().await.unwrap();

        let install = runner
            .commands()
            .into_iter()
            .find(|c| c.contains("curl"))
            .expect("kubectl downloaded");
        assert!(install.contains(KUBECTL_VERSION));
        assert!(install.contains("/.workdock/kubectl"));
    }

    #[tokio::test]
    async fn present_kubectl_is_not_reinstalled() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .with_file("/home/dev/.workdock/kubectl", "")
                .on("config current-context", "kind-dev")
                .on("get nodes", "node-1 Ready"),
        );
        let driver = driver_with(Arc::clone(&runner), cluster(Some("dev")));
        driver.ensure_ready().await.unwrap();
        assert_eq!(runner.count_matching("curl"), 0);
    }

    #[tokio::test]
    async fn empty_namespace_generates_six_lowercase_letters() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .with_file("/home/dev/.workdock/kubectl", "")
                .on("config current-context", "kind-dev")
                .on("get nodes", "node-1 Ready")
                .on_failure("get namespace", 1, "Error from server (NotFound): namespaces not found"),
        );
        let driver = driver_with(Arc::clone(&runner), cluster(None));
        driver.ensure_ready().await.unwrap();

        let ns = driver.namespace().unwrap();
        assert_eq!(ns.len(), 6);
        assert!(ns.chars().all(|c| c.is_ascii_lowercase()));
        assert_eq!(runner.count_matching("create namespace"), 1);
    }

    #[tokio::test]
    async fn inline_kubeconfig_is_materialized() {
        let mut cluster = cluster(Some("dev"));
        cluster.kubeconfig = Some(Kubeconfig::Inline("apiVersion: v1\nkind: Config\n".into()));
        let runner = Arc::new(
            ScriptedRunner::new()
                .with_file("/home/dev/.workdock/kubectl", "")
                .on("config current-context", "kind-dev")
                .on("get nodes", "node-1 Ready"),
        );
        let driver = driver_with(Arc::clone(&runner), cluster);
        driver.ensure_ready().await.unwrap();

        assert!(runner.file("/home/dev/.kube/config_workdock").is_some());
        assert!(runner
            .commands()
            .iter()
            .any(|c| c.contains("--kubeconfig") && c.contains("config_workdock")));
    }

    #[tokio::test]
    async fn up_applies_waits_and_clones_in_pod() {
        let (desc, effective) = k8s_desc("devns");
        let runner = Arc::new(
            ScriptedRunner::new()
                .with_file("/home/dev/.workdock/kubectl", "")
                .on("config current-context", "kind-dev")
                .on("get nodes", "node-1 Ready")
                .on("get pods -l app=web", "web-6d4f9c7b-x2m"),
        );
        let driver = driver_with(Arc::clone(&runner), cluster(Some("devns")));
        driver.ensure_ready().await.unwrap();
        driver.write_manifest(&desc).await.unwrap();

        let bindings = driver.up(&desc, &effective).await.unwrap();
        assert!(bindings.iter().any(|b| b.label == "webide"));

        let commands = runner.commands();
        let apply = commands.iter().position(|c| c.contains("apply -f")).unwrap();
        let rollout = commands
            .iter()
            .position(|c| c.contains("rollout status deployment/web"))
            .unwrap();
        let clone = commands.iter().position(|c| c.contains("git clone")).unwrap();
        assert!(apply < rollout && rollout < clone);

        // non-root user wraps the in-pod command in su with doubled quotes
        let exec = commands.iter().find(|c| c.contains("git clone")).unwrap();
        assert!(exec.contains("su smartuser -c"));
    }

    #[tokio::test]
    async fn down_scales_deployments_to_zero() {
        let (desc, _) = k8s_desc("devns");
        let runner = Arc::new(
            ScriptedRunner::new()
                .with_file("/home/dev/.workdock/kubectl", "")
                .on("config current-context", "kind-dev")
                .on("get nodes", "node-1 Ready"),
        );
        let driver = driver_with(Arc::clone(&runner), cluster(Some("devns")));
        driver.ensure_ready().await.unwrap();
        driver.down(&desc).await.unwrap();

        assert_eq!(runner.count_matching("scale deployment/web --replicas=0"), 1);
    }

    #[test]
    fn su_wrapping_doubles_single_quotes() {
        let wrapped = wrap_run_as("echo 'hi'", Some("smartuser"));
        assert_eq!(wrapped, "su smartuser -c 'echo ''hi'''");
        assert_eq!(wrap_run_as("id", Some("root")), "id");
        assert_eq!(wrap_run_as("id", None), "id");
    }

    #[test]
    fn manifest_objects_finds_kinds_and_names() {
        let (desc, _) = k8s_desc("devns");
        let objects = manifest_objects(&desc.manifest_content);
        assert!(objects.contains(&("Deployment".into(), "web".into())));
        assert!(objects.contains(&("Service".into(), "web".into())));
    }
}
