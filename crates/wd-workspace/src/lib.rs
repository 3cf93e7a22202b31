//! Workspace descriptor model and the registry facade over the local store.

pub mod descriptor;
pub mod registry;

pub use descriptor::{
    ClusterRef, GitAuth, Kubeconfig, PortBinding, RemoteAuth, RemoteHost, Stage,
    WorkspaceDescriptor, WorkspaceExtend, WorkspaceMode, WorkspaceState,
};
pub use registry::Registry;

pub use wd_local_db::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
