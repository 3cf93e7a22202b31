//! The authoritative record of one workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use wd_local_db::Error;

/// Execution substrate of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    Local,
    Remote,
    K8s,
}

impl WorkspaceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceMode::Local => "local",
            WorkspaceMode::Remote => "remote",
            WorkspaceMode::K8s => "k8s",
        }
    }
}

impl std::str::FromStr for WorkspaceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(WorkspaceMode::Local),
            "remote" => Ok(WorkspaceMode::Remote),
            "k8s" => Ok(WorkspaceMode::K8s),
            other => Err(Error::validation(format!("unknown mode {:?}", other))),
        }
    }
}

impl fmt::Display for WorkspaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the Git repository is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitAuth {
    #[default]
    Public,
    Basic,
    Ssh,
}

impl GitAuth {
    pub fn as_str(self) -> &'static str {
        match self {
            GitAuth::Public => "public",
            GitAuth::Basic => "basic",
            GitAuth::Ssh => "ssh",
        }
    }
}

impl std::str::FromStr for GitAuth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(GitAuth::Public),
            "basic" => Ok(GitAuth::Basic),
            "ssh" => Ok(GitAuth::Ssh),
            other => Err(Error::validation(format!("unknown git auth {:?}", other))),
        }
    }
}

/// Credential of an SSH remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteAuth {
    Password,
    Key,
}

impl RemoteAuth {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteAuth::Password => "password",
            RemoteAuth::Key => "key",
        }
    }
}

impl std::str::FromStr for RemoteAuth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "password" => Ok(RemoteAuth::Password),
            "key" => Ok(RemoteAuth::Key),
            other => Err(Error::validation(format!("unknown remote auth {:?}", other))),
        }
    }
}

/// SSH host a remote workspace runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub address: String,
    pub ssh_port: u16,
    pub user_name: String,
    pub auth: RemoteAuth,
    /// Password or private-key blob, depending on `auth`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Kubeconfig source; exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kubeconfig {
    Path(String),
    Inline(String),
}

/// Kubernetes cluster a k8s workspace runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<Kubeconfig>,
}

/// One forwarded port: substrate host side and client side, joined across
/// restarts by the label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub service: String,
    pub container_port: u16,
    pub current_host_port: u16,
    pub client_port: u16,
    pub label: String,
}

/// A stage of the workspace state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preparing,
    Cloning,
    Materializing,
    Launching,
    Tunneling,
    Stopping,
    Removing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::Cloning => "cloning",
            Stage::Materializing => "materializing",
            Stage::Launching => "launching",
            Stage::Tunneling => "tunneling",
            Stage::Stopping => "stopping",
            Stage::Removing => "removing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preparing" => Ok(Stage::Preparing),
            "cloning" => Ok(Stage::Cloning),
            "materializing" => Ok(Stage::Materializing),
            "launching" => Ok(Stage::Launching),
            "tunneling" => Ok(Stage::Tunneling),
            "stopping" => Ok(Stage::Stopping),
            "removing" => Ok(Stage::Removing),
            other => Err(Error::validation(format!("unknown stage {:?}", other))),
        }
    }
}

/// Resting state of a workspace. `running` and `stopped` are the only
/// stable states; `error@<stage>` records where a start attempt died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum WorkspaceState {
    #[default]
    Init,
    Running,
    Stopped,
    Removed,
    Error {
        stage: Stage,
    },
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceState::Init => f.write_str("init"),
            WorkspaceState::Running => f.write_str("running"),
            WorkspaceState::Stopped => f.write_str("stopped"),
            WorkspaceState::Removed => f.write_str("removed"),
            WorkspaceState::Error { stage } => write!(f, "error@{}", stage),
        }
    }
}

impl From<WorkspaceState> for String {
    fn from(state: WorkspaceState) -> Self {
        state.to_string()
    }
}

impl TryFrom<String> for WorkspaceState {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        match s.as_str() {
            "init" => Ok(WorkspaceState::Init),
            "running" => Ok(WorkspaceState::Running),
            "stopped" => Ok(WorkspaceState::Stopped),
            "removed" => Ok(WorkspaceState::Removed),
            other => match other.strip_prefix("error@") {
                Some(stage) => Ok(WorkspaceState::Error {
                    stage: stage.parse()?,
                }),
                None => Err(Error::validation(format!("unknown state {:?}", other))),
            },
        }
    }
}

/// Extension record: state plus port bindings, serialized as one JSON
/// column so old registries keep loading as fields are added.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceExtend {
    #[serde(default)]
    pub state: WorkspaceState,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
}

/// The authoritative record of one workspace. Owned by the registry; the
/// orchestrator works on value copies and writes back at commit points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub mode: WorkspaceMode,
    pub working_dir: String,
    pub git_url: String,
    pub branch: String,
    #[serde(default)]
    pub git_auth: GitAuth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_secret: Option<String>,
    pub config_path: String,
    #[serde(default)]
    pub config_content: String,
    #[serde(default)]
    pub link_compose_content: String,
    #[serde(default)]
    pub manifest_content: String,
    #[serde(default)]
    pub extend: WorkspaceExtend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl WorkspaceDescriptor {
    /// Model invariants checked before any persistence or launch.
    pub fn validate(&self) -> crate::Result<()> {
        match self.mode {
            WorkspaceMode::Remote => {
                if self.remote.is_none() {
                    return Err(Error::validation(
                        "remote workspace needs a remote host",
                    ));
                }
            }
            WorkspaceMode::K8s => {
                let cluster = self
                    .cluster
                    .as_ref()
                    .ok_or_else(|| Error::validation("k8s workspace needs a cluster ref"))?;
                if cluster.context.trim().is_empty() {
                    return Err(Error::validation("cluster context is empty"));
                }
            }
            WorkspaceMode::Local => {}
        }
        if self.git_auth == GitAuth::Basic
            && (self.git_username.is_none() || self.git_secret.is_none())
        {
            return Err(Error::validation(
                "basic git auth needs username and password",
            ));
        }
        Ok(())
    }

    /// `label -> substrate host port` of the last committed run.
    pub fn prior_host_ports(&self) -> BTreeMap<String, u16> {
        self.extend
            .ports
            .iter()
            .map(|p| (p.label.clone(), p.current_host_port))
            .collect()
    }

    /// `label -> client port` of the last committed run.
    pub fn prior_client_ports(&self) -> BTreeMap<String, u16> {
        self.extend
            .ports
            .iter()
            .map(|p| (p.label.clone(), p.client_port))
            .collect()
    }

    /// Stable per-workspace manifest path on the substrate, derived from
    /// the working directory so restarts overwrite in place.
    pub fn manifest_path(&self) -> String {
        format!("{}/.ide/docker-compose.yml", self.working_dir.trim_end_matches('/'))
    }

    /// Compose project name; doubles as the network name prefix. Fresh
    /// workspaces have no id yet and fall back to the checkout directory
    /// name, which is part of the natural key and equally stable.
    pub fn project_name(&self) -> String {
        match self.id {
            Some(id) => format!("wd{}", id),
            None => {
                let base = self
                    .working_dir
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or("workspace");
                let slug: String = base
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                    .collect();
                format!("wd-{}", slug.trim_matches('-'))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_string_round_trip() {
        for state in [
            WorkspaceState::Init,
            WorkspaceState::Running,
            WorkspaceState::Stopped,
            WorkspaceState::Removed,
            WorkspaceState::Error {
                stage: Stage::Tunneling,
            },
        ] {
            let text = String::from(state);
            assert_eq!(WorkspaceState::try_from(text).unwrap(), state);
        }
        assert_eq!(
            WorkspaceState::Error {
                stage: Stage::Tunneling
            }
            .to_string(),
            "error@tunneling"
        );
    }

    #[test]
    fn extend_json_round_trip() {
        let extend = WorkspaceExtend {
            state: WorkspaceState::Running,
            ports: vec![PortBinding {
                service: "web".into(),
                container_port: 3000,
                current_host_port: 3001,
                client_port: 3001,
                label: "web".into(),
            }],
        };
        let json = serde_json::to_string(&extend).unwrap();
        let back: WorkspaceExtend = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, WorkspaceState::Running);
        assert_eq!(back.ports, extend.ports);
    }

    #[test]
    fn validate_checks_mode_invariants() {
        let mut desc = WorkspaceDescriptor {
            id: None,
            name: "ws".into(),
            mode: WorkspaceMode::Remote,
            working_dir: "/home/dev/ws".into(),
            git_url: "https://example.com/example.git".into(),
            branch: "main".into(),
            git_auth: GitAuth::Public,
            git_username: None,
            git_secret: None,
            config_path: ".ide/config.yaml".into(),
            config_content: String::new(),
            link_compose_content: String::new(),
            manifest_content: String::new(),
            extend: WorkspaceExtend::default(),
            remote: None,
            cluster: None,
            created_at: None,
        };
        assert!(desc.validate().is_err());

        desc.remote = Some(RemoteHost {
            id: None,
            address: "10.0.0.8".into(),
            ssh_port: 22,
            user_name: "dev".into(),
            auth: RemoteAuth::Password,
            secret: Some("pw".into()),
        });
        assert!(desc.validate().is_ok());

        desc.git_auth = GitAuth::Basic;
        assert!(desc.validate().is_err());
    }
}
