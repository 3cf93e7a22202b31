//! The declarative config file a user commits to their repo.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ConfigError;

/// Top level of the declarative YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdeConfig {
    #[serde(default)]
    pub version: Option<String>,
    pub workspace: WorkspaceSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkspaceSection {
    pub dev_container: DevContainer,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    /// Relative path of a Compose file whose services are overlaid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_compose: Option<String>,
    /// Relative path of raw Kubernetes objects (k8s mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_deployments: Option<String>,
    /// Optional ingress host for the web IDE (k8s mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSection>,
}

/// The single service the user's IDE attaches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DevContainer {
    pub service_name: String,
    /// Labeled ports: label -> container port.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub ide_type: IdeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<String>,
}

/// Protocol of the in-container editor UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdeType {
    #[default]
    Vscode,
    JbProjector,
    Opensumi,
    SdkOnly,
}

impl IdeType {
    /// Container port the editor UI listens on when the config does not
    /// label one explicitly. `None` for SDK-only containers.
    pub fn default_web_port(self) -> Option<u16> {
        match self {
            IdeType::Vscode => Some(6800),
            IdeType::JbProjector => Some(8887),
            IdeType::Opensumi => Some(3000),
            IdeType::SdkOnly => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    /// `host:container` pairs; the host side is a preference, not a claim.
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IngressSection {
    pub host: String,
    #[serde(default)]
    pub tls: bool,
}

impl IdeConfig {
    /// Parse the declarative YAML, reporting the line on failure.
    pub fn parse(text: &str) -> crate::Result<Self> {
        serde_yaml::from_str(text).map_err(ConfigError::parse)
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Split a `host:container` port entry.
pub fn split_port_pair(entry: &str) -> crate::Result<(u16, u16)> {
    let mut parts = entry.splitn(2, ':');
    let host = parts.next().unwrap_or("");
    let container = parts.next().unwrap_or(host);
    let parse = |s: &str| {
        s.trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::Validation(format!("bad port entry {:?}", entry)))
    };
    Ok((parse(host)?, parse(container)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
workspace:
  dev-container:
    service-name: web
    ports:
      webide: 6800
      tools: 3000
    ide-type: vscode
  services:
    web:
      image: registry.example.com/web:latest
      environment:
        LANG: C.UTF-8
      ports:
        - "3000:3000"
"#;

    #[test]
    fn parses_sample_config() {
        let config = IdeConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.workspace.dev_container.service_name, "web");
        assert_eq!(config.workspace.dev_container.ide_type, IdeType::Vscode);
        assert_eq!(
            config.workspace.dev_container.ports.get("webide").copied(),
            Some(6800)
        );
        assert!(config.workspace.services.contains_key("web"));
    }

    #[test]
    fn parse_error_reports_line() {
        let bad = "workspace:\n  dev-container: [not, a, mapping]\n";
        match IdeConfig::parse(bad) {
            Err(ConfigError::Parse { line, .. }) => assert!(line > 0),
            other => panic!("expected parse error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ide_type_defaults_to_vscode() {
        let minimal = "workspace:\n  dev-container:\n    service-name: app\n";
        let config = IdeConfig::parse(minimal).unwrap();
        assert_eq!(config.workspace.dev_container.ide_type, IdeType::Vscode);
    }

    #[test]
    fn split_port_pair_accepts_single_port() {
        assert_eq!(split_port_pair("8080:80").unwrap(), (8080, 80));
        assert_eq!(split_port_pair("9000").unwrap(), (9000, 9000));
        assert!(split_port_pair("web:80").is_err());
    }
}
