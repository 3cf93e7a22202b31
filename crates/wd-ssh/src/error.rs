//! Error types for the SSH layer.

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("connection to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error("authentication rejected for user {user}")]
    AuthRejected { user: String },

    #[error("bad private key: {0}")]
    BadKey(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("remote command failed (exit {exit_code}): {stderr}")]
    CommandFailed { exit_code: u32, stderr: String },

    #[error("tunnel listener on {addr} failed: {message}")]
    Listener { addr: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Channel(err.to_string())
    }
}
