//! Declarative workspace configuration and manifest lowering.
//!
//! The user commits a small YAML file describing the services of a dev
//! environment. This crate parses it, merges an optionally linked Compose
//! file, assigns restart-stable host ports to every labeled port, and lowers
//! the result into the substrate-specific runtime manifest.

pub mod compose;
pub mod error;
pub mod ide;
pub mod k8s;
pub mod ports;
pub mod resolver;

pub use compose::{ComposeFile, ComposeService};
pub use error::ConfigError;
pub use ide::{DevContainer, IdeConfig, IdeType, ServiceSpec};
pub use k8s::K8sManifest;
pub use ports::{alloc_port, PortExhaustedError, PortProbe, PROBE_WINDOW};
pub use resolver::{
    resolve, EffectiveConfig, LabeledPort, ManifestTarget, Resolved, ResolveInput, ServicePlan,
    WEB_IDE_LABEL,
};

use serde::{Deserialize, Serialize};

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// The substrate-specific lowered form of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuntimeManifest {
    Compose(ComposeFile),
    K8s(K8sManifest),
}

impl RuntimeManifest {
    /// Serialize the manifest the way it is written to the substrate.
    pub fn to_yaml(&self) -> Result<String> {
        match self {
            RuntimeManifest::Compose(compose) => compose.to_yaml(),
            RuntimeManifest::K8s(manifest) => manifest.to_yaml(),
        }
    }

    pub fn as_compose(&self) -> Option<&ComposeFile> {
        match self {
            RuntimeManifest::Compose(compose) => Some(compose),
            RuntimeManifest::K8s(_) => None,
        }
    }

    pub fn as_k8s(&self) -> Option<&K8sManifest> {
        match self {
            RuntimeManifest::K8s(manifest) => Some(manifest),
            RuntimeManifest::Compose(_) => None,
        }
    }
}
