//! SSH client transport and the TCP tunnel supervisor.

pub mod error;
pub mod transport;
pub mod tunnel;

pub use error::SshError;
pub use transport::{SshAuth, SshOutput, SshTransport};
pub use tunnel::{ChannelOpener, Forward, TunnelStream, TunnelSupervisor};

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, SshError>;
