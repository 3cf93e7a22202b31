//! Error types for the registry store.

/// Errors produced by the local database layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A record violates a model invariant and was rejected before touching
    /// the database.
    #[error("validation: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{0} not found")]
    NotFound(String),

    /// An update touched an unexpected number of rows.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("secret cipher: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict(message.into())
    }
}
