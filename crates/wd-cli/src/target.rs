//! Workspace targeting shared by start/stop/remove/connect: an id, or a
//! natural key built from repo + substrate flags.

use anyhow::{Context, Result};
use clap::Args;

use wd_core::WorkspaceInput;
use wd_workspace::{
    ClusterRef, GitAuth, Kubeconfig, RemoteAuth, RemoteHost, WorkspaceDescriptor, WorkspaceExtend,
    WorkspaceMode,
};

#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Workspace id, or a Git clone URL
    #[arg(value_name = "ID|GIT_URL")]
    pub target: Option<String>,

    /// Branch to check out
    #[arg(long = "branch", short = 'b', default_value = "")]
    pub branch: String,

    /// Working directory on the substrate
    #[arg(long = "workingdir", short = 'w')]
    pub workingdir: Option<String>,

    /// Config file path relative to the working directory
    #[arg(long = "filepath", short = 'f', default_value = ".ide/config.yaml")]
    pub filepath: String,

    /// Git user name for basic auth
    #[arg(long = "gituser")]
    pub gituser: Option<String>,

    /// Git password/token for basic auth
    #[arg(long = "gitpassword")]
    pub gitpassword: Option<String>,

    /// Private key file for git-over-ssh
    #[arg(long = "git-ssh-key")]
    pub git_ssh_key: Option<String>,

    /// Remote host address (SSH-remote mode)
    #[arg(long = "host")]
    pub host: Option<String>,

    /// Remote SSH port
    #[arg(long = "port", default_value_t = 22)]
    pub port: u16,

    /// Remote user name
    #[arg(long = "username", short = 'u')]
    pub username: Option<String>,

    /// Remote password
    #[arg(long = "password", short = 'p')]
    pub password: Option<String>,

    /// Private key file for the remote host
    #[arg(long = "ssh-key")]
    pub ssh_key: Option<String>,

    /// Kubernetes context (k8s mode)
    #[arg(long = "context", short = 'k')]
    pub context: Option<String>,

    /// Kubernetes namespace; generated when omitted
    #[arg(long = "namespace")]
    pub namespace: Option<String>,

    /// kubeconfig file path
    #[arg(long = "kubeconfig")]
    pub kubeconfig: Option<String>,

    /// kubeconfig content, inline
    #[arg(long = "kubeconfig-content")]
    pub kubeconfig_content: Option<String>,
}

impl TargetArgs {
    /// Workspace id when the positional target is numeric.
    pub fn workspace_id(&self) -> Option<i64> {
        self.target.as_deref().and_then(|t| t.parse().ok())
    }

    /// Resolve into an engine input: an id, or a descriptor to match or
    /// create.
    pub fn to_input(&self) -> Result<WorkspaceInput> {
        if let Some(id) = self.workspace_id() {
            return Ok(WorkspaceInput::Id(id));
        }
        Ok(WorkspaceInput::Descriptor(Box::new(self.to_descriptor()?)))
    }

    pub fn to_descriptor(&self) -> Result<WorkspaceDescriptor> {
        let git_url = self
            .target
            .clone()
            .context("a workspace id or Git URL is required")?;

        let mode = if self.context.is_some() {
            WorkspaceMode::K8s
        } else if self.host.is_some() {
            WorkspaceMode::Remote
        } else {
            WorkspaceMode::Local
        };

        let remote = match mode {
            WorkspaceMode::Remote => {
                let address = self.host.clone().context("--host is required")?;
                let user_name = self.username.clone().context("--username is required")?;
                let (auth, secret) = match (&self.password, &self.ssh_key) {
                    (Some(password), None) => (RemoteAuth::Password, password.clone()),
                    (None, Some(key_path)) => {
                        let blob = std::fs::read_to_string(key_path)
                            .with_context(|| format!("cannot read {}", key_path))?;
                        (RemoteAuth::Key, blob)
                    }
                    (Some(_), Some(_)) => {
                        anyhow::bail!("--password and --ssh-key are mutually exclusive")
                    }
                    (None, None) => anyhow::bail!("remote mode needs --password or --ssh-key"),
                };
                Some(RemoteHost {
                    id: None,
                    address,
                    ssh_port: self.port,
                    user_name,
                    auth,
                    secret: Some(secret),
                })
            }
            _ => None,
        };

        let cluster = match mode {
            WorkspaceMode::K8s => {
                let kubeconfig = match (&self.kubeconfig, &self.kubeconfig_content) {
                    (Some(_), Some(_)) => {
                        anyhow::bail!("--kubeconfig and --kubeconfig-content are mutually exclusive")
                    }
                    (Some(path), None) => Some(Kubeconfig::Path(path.clone())),
                    (None, Some(content)) => Some(Kubeconfig::Inline(content.clone())),
                    (None, None) => None,
                };
                Some(ClusterRef {
                    id: None,
                    context: self.context.clone().unwrap_or_default(),
                    namespace: self.namespace.clone(),
                    kubeconfig,
                })
            }
            _ => None,
        };

        let (git_auth, git_username, git_secret) =
            match (&self.gituser, &self.gitpassword, &self.git_ssh_key) {
                (Some(user), Some(password), None) => {
                    (GitAuth::Basic, Some(user.clone()), Some(password.clone()))
                }
                (_, _, Some(key_path)) => {
                    let blob = std::fs::read_to_string(key_path)
                        .with_context(|| format!("cannot read {}", key_path))?;
                    (GitAuth::Ssh, None, Some(blob))
                }
                _ if git_url.starts_with("git@") => (GitAuth::Ssh, None, None),
                _ => (GitAuth::Public, None, None),
            };

        let working_dir = match &self.workingdir {
            Some(dir) => dir.clone(),
            None => default_working_dir(mode, &git_url, remote.as_ref()),
        };

        Ok(WorkspaceDescriptor {
            id: None,
            name: String::new(),
            mode,
            working_dir,
            git_url,
            branch: self.branch.clone(),
            git_auth,
            git_username,
            git_secret,
            config_path: self.filepath.clone(),
            config_content: String::new(),
            link_compose_content: String::new(),
            manifest_content: String::new(),
            extend: WorkspaceExtend::default(),
            remote,
            cluster,
            created_at: None,
        })
    }
}

/// `./workspaces/<repo>` locally, `~/project/<repo>` on a remote host,
/// `/home/project` inside a pod.
fn default_working_dir(mode: WorkspaceMode, git_url: &str, remote: Option<&RemoteHost>) -> String {
    let repo = repo_name(git_url);
    match mode {
        WorkspaceMode::Local => format!("./workspaces/{}", repo),
        WorkspaceMode::Remote => {
            let user = remote.map(|r| r.user_name.as_str()).unwrap_or("root");
            format!("/home/{}/project/{}", user, repo)
        }
        WorkspaceMode::K8s => "/home/project".to_string(),
    }
}

fn repo_name(git_url: &str) -> String {
    git_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("workspace")
        .trim_end_matches(".git")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_target_is_an_id() {
        let args = TargetArgs {
            target: Some("42".into()),
            ..Default::default()
        };
        assert_eq!(args.workspace_id(), Some(42));
        assert!(matches!(args.to_input().unwrap(), WorkspaceInput::Id(42)));
    }

    #[test]
    fn url_target_builds_local_descriptor() {
        let args = TargetArgs {
            target: Some("https://example.com/team/example.git".into()),
            branch: "main".into(),
            filepath: ".ide/config.yaml".into(),
            ..Default::default()
        };
        let desc = args.to_descriptor().unwrap();
        assert_eq!(desc.mode, WorkspaceMode::Local);
        assert_eq!(desc.working_dir, "./workspaces/example");
        assert_eq!(desc.git_auth, GitAuth::Public);
    }

    #[test]
    fn host_flag_selects_remote_mode() {
        let args = TargetArgs {
            target: Some("https://example.com/example.git".into()),
            host: Some("10.0.0.8".into()),
            username: Some("dev".into()),
            password: Some("pw".into()),
            filepath: ".ide/config.yaml".into(),
            ..Default::default()
        };
        let desc = args.to_descriptor().unwrap();
        assert_eq!(desc.mode, WorkspaceMode::Remote);
        let remote = desc.remote.unwrap();
        assert_eq!(remote.auth, RemoteAuth::Password);
        assert_eq!(desc.working_dir, "/home/dev/project/example");
    }

    #[test]
    fn kubeconfig_path_and_content_are_rejected_together() {
        let args = TargetArgs {
            target: Some("https://example.com/example.git".into()),
            context: Some("kind-dev".into()),
            kubeconfig: Some("~/.kube/config".into()),
            kubeconfig_content: Some("apiVersion: v1".into()),
            filepath: ".ide/config.yaml".into(),
            ..Default::default()
        };
        assert!(args.to_descriptor().is_err());
    }

    #[test]
    fn git_at_url_implies_ssh_auth() {
        let args = TargetArgs {
            target: Some("git@example.com:team/example.git".into()),
            filepath: ".ide/config.yaml".into(),
            ..Default::default()
        };
        let desc = args.to_descriptor().unwrap();
        assert_eq!(desc.git_auth, GitAuth::Ssh);
    }
}
