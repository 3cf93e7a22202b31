//! Embedded SQLite persistence for the workdock workspace registry.
//!
//! One `workspaces` relation plus foreign rows for SSH remotes and
//! Kubernetes clusters. Secret columns never hit disk in the clear; they
//! pass through [`SecretCipher`] with a key supplied by the embedding
//! application.

pub mod connection;
pub mod error;
pub mod migrations;
pub mod models;
pub mod schema;
pub mod secret;

pub use connection::Database;
pub use error::Error;
pub use models::{
    ClusterRecord, ClusterStore, RemoteRecord, RemoteStore, WorkspaceKey, WorkspaceRecord,
    WorkspaceStore,
};
pub use secret::SecretCipher;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
