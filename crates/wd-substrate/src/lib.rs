//! Substrate drivers.
//!
//! A substrate is where a workspace's containers actually run: the local
//! host, a remote Linux host over SSH, or a Kubernetes namespace. Every
//! driver exposes the same capability set and shells all external work
//! through a [`CommandRunner`], so tests swap in a scripted runner instead
//! of real Docker, SSH or kubectl.

pub mod docker;
pub mod driver;
pub mod error;
pub mod health;
pub mod k8s;
pub mod local;
pub mod remote;
pub mod runner;
pub mod scripted;
pub mod sources;

pub use driver::{SubstrateDriver, SubstrateStatus};
pub use error::SubstrateError;
pub use k8s::{K8sDriver, KUBECTL_VERSION};
pub use local::LocalDriver;
pub use remote::SshRemoteDriver;
pub use runner::{CommandRunner, LocalRunner, RunOutput, SshRunner};
pub use scripted::ScriptedRunner;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, SubstrateError>;
