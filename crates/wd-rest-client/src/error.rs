//! Error types for the control-plane client.

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum RestClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url: {0}")]
    Url(#[from] url::ParseError),

    /// The API answered with a non-zero application code.
    #[error("api error {code}: {msg}")]
    Api { code: i64, msg: String },

    /// 4xx: the request itself is wrong, retrying cannot help.
    #[error("request rejected ({status}): {body}")]
    Rejected { status: StatusCode, body: String },

    /// 5xx on every attempt.
    #[error("server unavailable after {attempts} attempts ({status})")]
    Unavailable { status: StatusCode, attempts: u32 },
}
