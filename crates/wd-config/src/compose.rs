//! Docker Compose document model, as much of it as the engine touches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ide::split_port_pair;
use crate::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ComposeService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// `host:container` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
}

impl ComposeFile {
    pub fn parse(text: &str) -> crate::Result<Self> {
        serde_yaml::from_str(text).map_err(ConfigError::parse)
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// All `(service, host_port, container_port)` triples in the document.
    pub fn host_ports(&self) -> crate::Result<Vec<(String, u16, u16)>> {
        let mut out = Vec::new();
        for (name, service) in &self.services {
            for entry in &service.ports {
                let (host, container) = split_port_pair(entry)?;
                out.push((name.clone(), host, container));
            }
        }
        Ok(out)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINKED: &str = r#"
version: "3"
services:
  web:
    image: node:18
    command: npm run dev
    ports:
      - "3000:3000"
  db:
    image: postgres:15
    environment:
      - POSTGRES_PASSWORD=dev
    ports:
      - "5432:5432"
"#;

    #[test]
    fn parses_linked_compose() {
        let compose = ComposeFile::parse(LINKED).unwrap();
        assert_eq!(compose.service_names(), vec!["db", "web"]);
        assert_eq!(
            compose.services["web"].command.as_deref(),
            Some("npm run dev")
        );
    }

    #[test]
    fn host_ports_reads_all_pairs() {
        let compose = ComposeFile::parse(LINKED).unwrap();
        let mut ports = compose.host_ports().unwrap();
        ports.sort();
        assert_eq!(
            ports,
            vec![
                ("db".to_string(), 5432, 5432),
                ("web".to_string(), 3000, 3000)
            ]
        );
    }

    #[test]
    fn yaml_round_trip_is_stable() {
        let compose = ComposeFile::parse(LINKED).unwrap();
        let text = compose.to_yaml().unwrap();
        let again = ComposeFile::parse(&text).unwrap();
        assert_eq!(again.service_names(), compose.service_names());
    }
}
