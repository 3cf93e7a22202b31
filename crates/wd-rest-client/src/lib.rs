//! Client for the optional control-plane HTTP API.
//!
//! The orchestrator posts lifecycle feedback and operation logs here when a
//! callback address is configured. Server errors are retried with backoff;
//! client errors surface immediately.

pub mod client;
pub mod error;
pub mod types;

pub use client::RestClient;
pub use error::RestClientError;
pub use types::{
    ApiEnvelope, FeedbackRequest, FeedbackStatus, LoginData, PortConfig, WorkspaceFindData,
    WsLogEntry,
};

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, RestClientError>;
