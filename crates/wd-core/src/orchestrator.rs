//! The state machine that sequences registry, resolver, drivers, tunnels
//! and feedback for each high-level command.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wd_config::{
    resolve, IdeConfig, ManifestTarget, ResolveInput, Resolved,
};
use wd_rest_client::RestClient;
use wd_ssh::{ChannelOpener, Forward, SshAuth, SshTransport, TunnelSupervisor};
use wd_substrate::{
    CommandRunner, K8sDriver, LocalDriver, LocalRunner, SshRemoteDriver, SshRunner,
    SubstrateDriver, SubstrateError,
};
use wd_workspace::{
    PortBinding, RemoteAuth, Registry, Stage, WorkspaceDescriptor, WorkspaceMode, WorkspaceState,
};

use crate::error::EngineError;
use crate::events::{ProgressEvent, ProgressSink};
use crate::feedback::Feedback;
use crate::lock::WorkspaceLock;
use crate::ports::{client_port_is_free, negotiate_client_ports};
use crate::profile::Profile;

const ENSURE_READY_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(300);

/// How the CLI was invoked; pipeline and server runs skip interactive
/// conveniences and return right after the workload is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Client,
    Server,
    Pipeline,
}

/// Engine-relevant flags of a `start` invocation.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Skip port forwarding entirely.
    pub unforward: bool,
    /// Assume sources are already present.
    pub disable_clone: bool,
    pub run_mode: RunMode,
}

/// Descriptor input: an existing id or a (possibly new) natural key.
#[derive(Debug)]
pub enum WorkspaceInput {
    Id(i64),
    Descriptor(Box<WorkspaceDescriptor>),
}

/// Everything a command needs from a substrate: the driver, its runner for
/// file access, and the tunnel path when one exists.
pub struct DriverHandle {
    pub driver: Arc<dyn SubstrateDriver>,
    pub runner: Arc<dyn CommandRunner>,
    pub tunnel_opener: Option<Arc<dyn ChannelOpener>>,
    pub k8s: Option<Arc<K8sDriver>>,
}

/// Builds a driver for a descriptor. The default implementation wires the
/// real substrates; tests substitute scripted ones.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(
        &self,
        desc: &WorkspaceDescriptor,
        cancel: CancellationToken,
    ) -> crate::Result<DriverHandle>;
}

/// Production factory: local processes, SSH sessions, kubectl.
pub struct DefaultDriverFactory {
    pub home: String,
    pub agent_binary: Option<Vec<u8>>,
}

#[async_trait]
impl DriverFactory for DefaultDriverFactory {
    async fn create(
        &self,
        desc: &WorkspaceDescriptor,
        cancel: CancellationToken,
    ) -> crate::Result<DriverHandle> {
        match desc.mode {
            WorkspaceMode::Local => {
                let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner::new(cancel.clone()));
                let driver = LocalDriver::new(Arc::clone(&runner), cancel);
                Ok(DriverHandle {
                    driver: Arc::new(driver),
                    runner,
                    tunnel_opener: None,
                    k8s: None,
                })
            }
            WorkspaceMode::Remote => {
                let remote = desc
                    .remote
                    .as_ref()
                    .ok_or_else(|| EngineError::Validation("remote workspace has no host".into()))?;
                let secret = remote.secret.clone().ok_or_else(|| {
                    EngineError::Validation("remote host has no credential".into())
                })?;
                let auth = match remote.auth {
                    RemoteAuth::Password => SshAuth::Password(secret),
                    RemoteAuth::Key => SshAuth::Key(secret),
                };
                let transport = Arc::new(
                    SshTransport::connect(&remote.address, remote.ssh_port, &remote.user_name, &auth)
                        .await?,
                );
                let runner: Arc<dyn CommandRunner> =
                    Arc::new(SshRunner::new(Arc::clone(&transport), cancel.clone()));
                let mut driver = SshRemoteDriver::new(Arc::clone(&runner), cancel);
                if let Some(agent) = &self.agent_binary {
                    driver = driver.with_agent_binary(agent.clone());
                }
                Ok(DriverHandle {
                    driver: Arc::new(driver),
                    runner,
                    tunnel_opener: Some(transport as Arc<dyn ChannelOpener>),
                    k8s: None,
                })
            }
            WorkspaceMode::K8s => {
                let cluster = desc.cluster.clone().ok_or_else(|| {
                    EngineError::Validation("k8s workspace has no cluster ref".into())
                })?;
                let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner::new(cancel.clone()));
                let mut driver =
                    K8sDriver::new(Arc::clone(&runner), cancel, cluster, self.home.clone());
                if let Some(agent) = &self.agent_binary {
                    driver = driver.with_agent_binary(agent.clone());
                }
                let driver = Arc::new(driver);
                Ok(DriverHandle {
                    driver: Arc::clone(&driver) as Arc<dyn SubstrateDriver>,
                    runner,
                    tunnel_opener: None,
                    k8s: Some(driver),
                })
            }
        }
    }
}

/// Result of a successful `start` (and of `connect`).
#[derive(Debug)]
pub struct StartOutcome {
    pub descriptor: WorkspaceDescriptor,
    pub bindings: Vec<PortBinding>,
    pub web_ide_url: Option<String>,
    /// Held by the caller for the lifetime of the forwards.
    pub tunnels: Option<TunnelSupervisor>,
    /// Supervised `kubectl port-forward` child, k8s mode only.
    pub port_forward: Option<JoinHandle<()>>,
}

pub type ConnectOutcome = StartOutcome;

/// Façade invoked by the CLI command handlers.
pub struct Orchestrator {
    registry: Registry,
    profile: Profile,
    home: PathBuf,
    callback: Option<RestClient>,
    factory: Arc<dyn DriverFactory>,
    cancel: CancellationToken,
    sink: Option<ProgressSink>,
    health_timeout: Duration,
}

impl Orchestrator {
    pub fn new(registry: Registry, profile: Profile, home: PathBuf) -> Self {
        let factory = Arc::new(DefaultDriverFactory {
            home: home.to_string_lossy().into_owned(),
            agent_binary: None,
        });
        Self {
            registry,
            profile,
            home,
            callback: None,
            factory,
            cancel: CancellationToken::new(),
            sink: None,
            health_timeout: HEALTH_TIMEOUT,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_callback(mut self, client: RestClient) -> Self {
        self.callback = Some(client);
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Token the caller cancels on user interrupt.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Profile snapshot taken at construction.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    fn locks_dir(&self) -> PathBuf {
        self.home.join(".workdock").join("locks")
    }

    fn feedback(&self, command: &str) -> Feedback {
        Feedback::new(self.callback.clone(), command)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    fn check_cancel(&self) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn edge(&self, feedback: &Feedback, ws_id: &str, stage: Stage) {
        info!(%stage, "entering stage");
        self.emit(ProgressEvent::StageStarted { stage });
        feedback.in_progress(ws_id, stage).await;
    }

    /// List live workspaces.
    pub fn list(&self) -> crate::Result<Vec<WorkspaceDescriptor>> {
        Ok(self.registry.list()?)
    }

    /// Drive a workspace to `running`.
    pub async fn start(
        &self,
        input: WorkspaceInput,
        opts: &StartOptions,
    ) -> crate::Result<StartOutcome> {
        let mut desc = self.resolve_input(input)?;
        desc.validate()?;
        let preexisting = desc.id;

        let _lock = WorkspaceLock::acquire(&self.locks_dir(), &lock_key(&desc))?;
        let feedback = self.feedback("start");
        feedback.started(&ws_id_of(&desc)).await;

        match self.run_start(&mut desc, opts, &feedback).await {
            Ok(outcome) => {
                feedback
                    .finished(
                        &ws_id_of(&outcome.descriptor),
                        outcome
                            .bindings
                            .iter()
                            .find(|b| Some(b.label.as_str()) == web_label(&outcome.descriptor))
                            .map(|b| b.client_port),
                    )
                    .await;
                Ok(outcome)
            }
            Err((stage, err)) => {
                // a cancel that lands after launch leaves containers behind;
                // stop them before surfacing
                if matches!(err, EngineError::Cancelled)
                    && matches!(stage, Stage::Launching | Stage::Tunneling)
                {
                    self.best_effort_down(&desc).await;
                }
                self.record_failure(&mut desc, preexisting, stage, &err).await;
                feedback
                    .failed(&ws_id_of(&desc), stage.as_str(), &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    async fn run_start(
        &self,
        desc: &mut WorkspaceDescriptor,
        opts: &StartOptions,
        feedback: &Feedback,
    ) -> std::result::Result<StartOutcome, (Stage, EngineError)> {
        let ws_id = ws_id_of(desc);

        // -- preparing ----------------------------------------------------
        let stage = Stage::Preparing;
        self.edge(feedback, &ws_id, stage).await;
        self.check_cancel().map_err(|e| (stage, e))?;
        let handle = self
            .factory
            .create(desc, self.cancel.clone())
            .await
            .map_err(|e| (stage, e))?;
        match tokio::time::timeout(ENSURE_READY_TIMEOUT, handle.driver.ensure_ready()).await {
            Ok(result) => result.map_err(|e| (stage, EngineError::at_stage(stage, e)))?,
            Err(_) => {
                return Err((
                    stage,
                    EngineError::at_stage(
                        stage,
                        SubstrateError::MissingPrerequisite(format!(
                            "readiness check timed out after {:?}",
                            ENSURE_READY_TIMEOUT
                        )),
                    ),
                ))
            }
        }
        // a generated namespace is persisted back onto the descriptor
        if let (Some(k8s), Some(cluster)) = (&handle.k8s, desc.cluster.as_mut()) {
            if cluster.namespace.as_deref().unwrap_or("").is_empty() {
                if let Some(ns) = k8s.namespace() {
                    cluster.namespace = Some(ns.clone());
                    if let Some(cluster_id) = cluster.id {
                        if let Err(e) = self.registry.update_cluster_namespace(cluster_id, &ns) {
                            warn!(error = %e, "could not persist generated namespace");
                        }
                    }
                }
            }
        }
        self.emit(ProgressEvent::StageCompleted { stage });

        // -- cloning ------------------------------------------------------
        let stage = Stage::Cloning;
        self.edge(feedback, &ws_id, stage).await;
        self.check_cancel().map_err(|e| (stage, e))?;
        if opts.disable_clone {
            debug!("clone disabled, assuming sources present");
        } else {
            handle
                .driver
                .materialize_sources(desc)
                .await
                .map_err(|e| (stage, EngineError::at_stage(stage, e)))?;
        }
        self.emit(ProgressEvent::StageCompleted { stage });

        // -- materializing ------------------------------------------------
        let stage = Stage::Materializing;
        self.edge(feedback, &ws_id, stage).await;
        self.check_cancel().map_err(|e| (stage, e))?;
        let resolved = self
            .materialize(desc, &handle)
            .await
            .map_err(|e| (stage, e))?;
        handle
            .driver
            .write_manifest(desc)
            .await
            .map_err(|e| (stage, EngineError::at_stage(stage, e)))?;
        self.emit(ProgressEvent::StageCompleted { stage });

        // -- launching ----------------------------------------------------
        let stage = Stage::Launching;
        self.edge(feedback, &ws_id, stage).await;
        self.check_cancel().map_err(|e| (stage, e))?;
        let mut bindings = handle
            .driver
            .up(desc, &resolved.effective)
            .await
            .map_err(|e| (stage, EngineError::at_stage(stage, e)))?;
        self.emit(ProgressEvent::StageCompleted { stage });

        // -- tunneling ----------------------------------------------------
        let stage = Stage::Tunneling;
        self.edge(feedback, &ws_id, stage).await;
        self.check_cancel().map_err(|e| (stage, e))?;
        if desc.mode != WorkspaceMode::Local {
            negotiate_client_ports(&mut bindings, &desc.prior_client_ports())
                .map_err(|e| (stage, e.into()))?;
        }
        let web_label = resolved
            .effective
            .web_ide_binding()
            .map(|p| p.label.clone());
        let forward_ports = !opts.unforward && opts.run_mode != RunMode::Pipeline;
        let mut tunnels = None;
        let mut port_forward = None;
        if forward_ports {
            match desc.mode {
                WorkspaceMode::Local => {}
                WorkspaceMode::Remote => {
                    let opener = handle.tunnel_opener.clone().ok_or_else(|| {
                        (stage, EngineError::Network("no tunnel transport".into()))
                    })?;
                    let forwards = bindings
                        .iter()
                        .map(|b| Forward {
                            client_addr: ([127, 0, 0, 1], b.client_port).into(),
                            substrate_host: "127.0.0.1".into(),
                            substrate_port: b.current_host_port,
                        })
                        .collect();
                    tunnels = Some(
                        TunnelSupervisor::start(opener, forwards)
                            .await
                            .map_err(|e| (stage, e.into()))?,
                    );
                }
                WorkspaceMode::K8s => {
                    let k8s = handle
                        .k8s
                        .as_ref()
                        .ok_or_else(|| (stage, EngineError::Validation("k8s handle missing".into())))?;
                    let pairs: Vec<(u16, u16)> = bindings
                        .iter()
                        .map(|b| (b.client_port, b.current_host_port))
                        .collect();
                    let command = k8s
                        .port_forward_command(&resolved.effective.dev_service, &pairs)
                        .map_err(|e| (stage, EngineError::at_stage(stage, e)))?;
                    let runner = Arc::clone(&handle.runner);
                    port_forward = Some(tokio::spawn(async move {
                        let mut sink = |line: &str| debug!(line, "port-forward");
                        if let Err(e) = runner.run_streaming(&command, &mut sink).await {
                            warn!(error = %e, "port-forward exited");
                        }
                    }));
                }
            }

            if let Some(label) = &web_label {
                if let Some(web) = bindings.iter().find(|b| &b.label == label) {
                    handle
                        .driver
                        .wait_healthy(web.client_port, self.health_timeout)
                        .await
                        .map_err(|e| (stage, EngineError::at_stage(stage, e)))?;
                }
            }
        }
        self.emit(ProgressEvent::StageCompleted { stage });

        // -- commit -------------------------------------------------------
        if desc.name.is_empty() {
            desc.name = resolved.effective.dev_service.clone();
        }
        desc.extend.state = WorkspaceState::Running;
        desc.extend.ports = bindings.clone();
        self.registry
            .insert_or_update(desc)
            .map_err(|e| (stage, e.into()))?;
        info!(id = ?desc.id, "workspace running");

        let web_ide_url = web_label
            .as_ref()
            .and_then(|label| bindings.iter().find(|b| &b.label == label))
            .map(|b| format!("http://localhost:{}", b.client_port));
        Ok(StartOutcome {
            descriptor: desc.clone(),
            bindings,
            web_ide_url,
            tunnels,
            port_forward,
        })
    }

    /// Read config + linked compose off the substrate and resolve the plan
    /// into the descriptor.
    async fn materialize(
        &self,
        desc: &mut WorkspaceDescriptor,
        handle: &DriverHandle,
    ) -> crate::Result<Resolved> {
        let config_text = if desc.mode == WorkspaceMode::K8s {
            // no host checkout on this substrate; the config travels in
            // the descriptor
            if desc.config_content.trim().is_empty() {
                return Err(EngineError::Validation(
                    "k8s workspace needs its config supplied up front".into(),
                ));
            }
            desc.config_content.clone()
        } else {
            let path = join_path(&desc.working_dir, &desc.config_path);
            handle
                .runner
                .read_file(&path)
                .await
                .map_err(|e| EngineError::at_stage(Stage::Materializing, e))?
        };

        let parsed = IdeConfig::parse(&config_text)?;
        let link_text = match (&parsed.workspace.link_compose, desc.mode) {
            (Some(rel), WorkspaceMode::Local | WorkspaceMode::Remote) => {
                let path = join_path(&desc.working_dir, rel);
                Some(
                    handle
                        .runner
                        .read_file(&path)
                        .await
                        .map_err(|e| EngineError::at_stage(Stage::Materializing, e))?,
                )
            }
            _ => None,
        };

        let target = match desc.mode {
            WorkspaceMode::K8s => ManifestTarget::K8s {
                namespace: desc
                    .cluster
                    .as_ref()
                    .and_then(|c| c.namespace.clone())
                    .unwrap_or_default(),
            },
            _ => ManifestTarget::Compose {
                project: desc.project_name(),
            },
        };
        // server-side port labels fill gaps the local record does not
        // cover; the local record wins on conflicts
        let mut prior_ports = desc.prior_host_ports();
        if let (Some(client), Some(id)) = (&self.callback, desc.id) {
            match client.find_workspace(&id.to_string()).await {
                Ok(Some(found)) => {
                    for pc in found.port_configs {
                        prior_ports.entry(pc.label).or_insert(pc.port);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "server workspace lookup failed, continuing"),
            }
        }
        let user_name = desc
            .remote
            .as_ref()
            .map(|r| r.user_name.clone())
            .unwrap_or_else(whoami);
        let resolve_input = ResolveInput {
            config_text: &config_text,
            link_compose_text: link_text.as_deref(),
            working_dir: &desc.working_dir,
            user_name: &user_name,
            prior_ports: &prior_ports,
            target,
        };

        let resolved = match handle
            .driver
            .host_ports_in_use()
            .await
            .map_err(|e| EngineError::at_stage(Stage::Materializing, e))?
        {
            None => resolve(&resolve_input, &client_port_is_free)?,
            Some(ports) => {
                let taken: HashSet<u16> = ports.into_iter().collect();
                let probe = move |port: u16| !taken.contains(&port);
                resolve(&resolve_input, &probe)?
            }
        };

        desc.config_content = config_text;
        desc.link_compose_content = link_text.unwrap_or_default();
        desc.manifest_content = resolved.manifest.to_yaml()?;
        Ok(resolved)
    }

    /// On cancellation after the workload launched, try to stop it before
    /// surfacing `Cancelled`. The cancelled token would abort the very
    /// cleanup we want, so a fresh handle drives it.
    async fn best_effort_down(&self, desc: &WorkspaceDescriptor) {
        match self.factory.create(desc, CancellationToken::new()).await {
            Ok(handle) => {
                if let Err(e) = handle.driver.ensure_ready().await {
                    warn!(error = %e, "best-effort stop after cancel failed");
                    return;
                }
                if let Err(e) = handle.driver.down(desc).await {
                    warn!(error = %e, "best-effort stop after cancel failed");
                }
            }
            Err(e) => warn!(error = %e, "no driver for best-effort stop"),
        }
    }

    /// Failure bookkeeping: a pre-existing workspace records `error@stage`;
    /// a fresh one is only persisted once the workload launched. Cancelled
    /// operations commit nothing.
    async fn record_failure(
        &self,
        desc: &mut WorkspaceDescriptor,
        preexisting: Option<i64>,
        stage: Stage,
        err: &EngineError,
    ) {
        if matches!(err, EngineError::Cancelled) {
            return;
        }
        let state = WorkspaceState::Error { stage };
        if let Some(id) = preexisting {
            if let Err(e) = self.registry.update_state(id, state) {
                warn!(error = %e, "could not record failure state");
            }
        } else if stage == Stage::Tunneling {
            desc.extend.state = state;
            if let Err(e) = self.registry.insert_or_update(desc) {
                warn!(error = %e, "could not persist failed workspace");
            }
        }
    }

    /// Drive a running workspace to `stopped`.
    pub async fn stop(&self, input: WorkspaceInput) -> crate::Result<WorkspaceDescriptor> {
        let desc = self.resolve_existing(input)?;
        let id = desc.id.expect("resolve_existing returns persisted rows");
        let _lock = WorkspaceLock::acquire(&self.locks_dir(), &lock_key(&desc))?;

        let feedback = self.feedback("stop");
        let ws_id = ws_id_of(&desc);
        feedback.started(&ws_id).await;

        let stage = Stage::Stopping;
        self.edge(&feedback, &ws_id, stage).await;
        let result: crate::Result<()> = async {
            let handle = self.factory.create(&desc, self.cancel.clone()).await?;
            handle
                .driver
                .ensure_ready()
                .await
                .map_err(|e| EngineError::at_stage(stage, e))?;
            handle
                .driver
                .down(&desc)
                .await
                .map_err(|e| EngineError::at_stage(stage, e))?;
            self.registry.update_state(id, WorkspaceState::Stopped)?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.emit(ProgressEvent::StageCompleted { stage });
                feedback.finished(&ws_id, None).await;
                info!(id, "workspace stopped");
                self.registry
                    .get(id)?
                    .ok_or_else(|| EngineError::Validation(format!("workspace {} vanished", id)))
            }
            Err(err) => {
                feedback.failed(&ws_id, stage.as_str(), &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Destroy the workload and soft-delete the descriptor.
    pub async fn remove(&self, input: WorkspaceInput, purge: bool) -> crate::Result<()> {
        let desc = self.resolve_existing(input)?;
        let id = desc.id.expect("resolve_existing returns persisted rows");
        let _lock = WorkspaceLock::acquire(&self.locks_dir(), &lock_key(&desc))?;

        let feedback = self.feedback("remove");
        let ws_id = ws_id_of(&desc);
        feedback.started(&ws_id).await;

        let stage = Stage::Removing;
        self.edge(&feedback, &ws_id, stage).await;
        let result: crate::Result<()> = async {
            let handle = self.factory.create(&desc, self.cancel.clone()).await?;
            handle
                .driver
                .ensure_ready()
                .await
                .map_err(|e| EngineError::at_stage(stage, e))?;
            handle
                .driver
                .remove(&desc, purge)
                .await
                .map_err(|e| EngineError::at_stage(stage, e))?;
            self.registry.update_state(id, WorkspaceState::Removed)?;
            self.registry.soft_delete(id)?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.emit(ProgressEvent::StageCompleted { stage });
                feedback.finished(&ws_id, None).await;
                info!(id, "workspace removed");
                Ok(())
            }
            Err(err) => {
                feedback.failed(&ws_id, stage.as_str(), &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Re-enter a running workspace: re-establish tunnels and wait for the
    /// IDE endpoint, touching nothing on the substrate.
    pub async fn connect(&self, id: i64) -> crate::Result<ConnectOutcome> {
        let desc = self
            .registry
            .get(id)?
            .ok_or_else(|| EngineError::Validation(format!("workspace {} not found", id)))?;
        if desc.extend.ports.is_empty() {
            return Err(EngineError::Validation(
                "workspace has no recorded port bindings; start it first".into(),
            ));
        }
        let _lock = WorkspaceLock::acquire(&self.locks_dir(), &lock_key(&desc))?;
        let feedback = self.feedback("connect");
        let ws_id = ws_id_of(&desc);
        feedback.started(&ws_id).await;

        let stage = Stage::Tunneling;
        self.edge(&feedback, &ws_id, stage).await;
        let handle = self.factory.create(&desc, self.cancel.clone()).await?;
        handle
            .driver
            .ensure_ready()
            .await
            .map_err(|e| EngineError::at_stage(stage, e))?;

        let mut bindings = desc.extend.ports.clone();
        if desc.mode != WorkspaceMode::Local {
            negotiate_client_ports(&mut bindings, &desc.prior_client_ports())?;
        }
        let mut tunnels = None;
        let mut port_forward = None;
        match desc.mode {
            WorkspaceMode::Local => {}
            WorkspaceMode::Remote => {
                let opener = handle
                    .tunnel_opener
                    .clone()
                    .ok_or_else(|| EngineError::Network("no tunnel transport".into()))?;
                let forwards = bindings
                    .iter()
                    .map(|b| Forward {
                        client_addr: ([127, 0, 0, 1], b.client_port).into(),
                        substrate_host: "127.0.0.1".into(),
                        substrate_port: b.current_host_port,
                    })
                    .collect();
                tunnels = Some(TunnelSupervisor::start(opener, forwards).await?);
            }
            WorkspaceMode::K8s => {
                let k8s = handle
                    .k8s
                    .as_ref()
                    .ok_or_else(|| EngineError::Validation("k8s handle missing".into()))?;
                let dev_service = web_label(&desc)
                    .and_then(|label| {
                        bindings
                            .iter()
                            .find(|b| b.label == label)
                            .map(|b| b.service.clone())
                    })
                    .ok_or_else(|| {
                        EngineError::Validation("no dev container port on record".into())
                    })?;
                let pairs: Vec<(u16, u16)> = bindings
                    .iter()
                    .map(|b| (b.client_port, b.current_host_port))
                    .collect();
                let command = k8s
                    .port_forward_command(&dev_service, &pairs)
                    .map_err(|e| EngineError::at_stage(stage, e))?;
                let runner = Arc::clone(&handle.runner);
                port_forward = Some(tokio::spawn(async move {
                    let mut sink = |line: &str| debug!(line, "port-forward");
                    if let Err(e) = runner.run_streaming(&command, &mut sink).await {
                        warn!(error = %e, "port-forward exited");
                    }
                }));
            }
        }

        let web = bindings
            .iter()
            .find(|b| Some(b.label.as_str()) == web_label(&desc))
            .cloned();
        if let Some(web) = &web {
            handle
                .driver
                .wait_healthy(web.client_port, self.health_timeout)
                .await
                .map_err(|e| EngineError::at_stage(stage, e))?;
        }
        self.emit(ProgressEvent::StageCompleted { stage });
        feedback
            .finished(&ws_id, web.as_ref().map(|b| b.client_port))
            .await;

        Ok(ConnectOutcome {
            web_ide_url: web.map(|b| format!("http://localhost:{}", b.client_port)),
            descriptor: desc,
            bindings,
            tunnels,
            port_forward,
        })
    }

    fn resolve_input(&self, input: WorkspaceInput) -> crate::Result<WorkspaceDescriptor> {
        match input {
            WorkspaceInput::Id(id) => self
                .registry
                .get(id)?
                .ok_or_else(|| EngineError::Validation(format!("workspace {} not found", id))),
            WorkspaceInput::Descriptor(desc) => {
                match self.registry.find_by_key(
                    desc.mode,
                    &desc.working_dir,
                    &desc.git_url,
                    &desc.branch,
                    &desc.config_path,
                    desc.remote.as_ref(),
                )? {
                    Some(mut stored) => {
                        // fresh credentials win over persisted ones
                        if desc.git_secret.is_some() {
                            stored.git_secret = desc.git_secret.clone();
                        }
                        if let (Some(stored_remote), Some(remote)) =
                            (stored.remote.as_mut(), desc.remote.as_ref())
                        {
                            if remote.secret.is_some() {
                                stored_remote.secret = remote.secret.clone();
                            }
                        }
                        Ok(stored)
                    }
                    None => Ok(*desc),
                }
            }
        }
    }

    fn resolve_existing(&self, input: WorkspaceInput) -> crate::Result<WorkspaceDescriptor> {
        let desc = self.resolve_input(input)?;
        if desc.id.is_none() {
            return Err(EngineError::Validation(
                "workspace is not registered on this host".into(),
            ));
        }
        Ok(desc)
    }
}

fn ws_id_of(desc: &WorkspaceDescriptor) -> String {
    desc.id.map(|id| id.to_string()).unwrap_or_default()
}

/// Stable web-IDE label of a persisted descriptor: `webide` when present,
/// else the dev container's lowest port label is already recorded first.
fn web_label(desc: &WorkspaceDescriptor) -> Option<&str> {
    desc.extend
        .ports
        .iter()
        .find(|p| p.label == wd_config::WEB_IDE_LABEL)
        .or_else(|| desc.extend.ports.iter().min_by_key(|p| p.container_port))
        .map(|p| p.label.as_str())
}

fn lock_key(desc: &WorkspaceDescriptor) -> String {
    match desc.id {
        Some(id) => id.to_string(),
        None => {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            (
                desc.mode.as_str(),
                &desc.working_dir,
                &desc.git_url,
                &desc.branch,
                &desc.config_path,
            )
                .hash(&mut hasher);
            format!("new-{:016x}", hasher.finish())
        }
    }
}

fn join_path(dir: &str, rel: &str) -> String {
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        rel.trim_start_matches("./").trim_start_matches('/')
    )
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "workdock".to_string())
}
