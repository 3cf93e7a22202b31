//! Workspace lifecycle orchestration.
//!
//! The orchestrator sequences registry, config resolution, substrate
//! drivers, tunnels and control-plane feedback for each high-level command.
//! It is the only component that mutates a descriptor across components.

pub mod error;
pub mod events;
pub mod feedback;
pub mod lock;
pub mod orchestrator;
pub mod ports;
pub mod profile;

pub use error::EngineError;
pub use events::{ProgressEvent, ProgressSink};
pub use feedback::Feedback;
pub use lock::WorkspaceLock;
pub use orchestrator::{
    ConnectOutcome, DriverFactory, DriverHandle, Orchestrator, RunMode, StartOptions,
    StartOutcome, WorkspaceInput,
};
pub use profile::{Auth, Profile, ProfileStore};

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, EngineError>;
