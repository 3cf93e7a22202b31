//! Control-plane REST client.

use std::time::Duration;

use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::error::RestClientError;
use crate::types::{
    ApiEnvelope, FeedbackRequest, LoginData, WorkspaceFindData, WsLogEntry,
};
use crate::Result;

/// 5xx responses are retried this many times in total.
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Client for the workdock control-plane API.
#[derive(Debug, Clone)]
pub struct RestClient {
    http_client: HttpClient,
    base_url: Url,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: Url, token: Option<String>) -> Self {
        let http_client = HttpClient::builder()
            .user_agent(concat!("workdock-cli/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http_client,
            base_url,
            token,
        }
    }

    pub fn from_url(base_url: &str, token: Option<String>) -> Result<Self> {
        Ok(Self::new(Url::parse(base_url)?, token))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Post a lifecycle feedback event.
    pub async fn post_feedback(&self, body: &FeedbackRequest) -> Result<()> {
        self.request::<serde_json::Value, _>(Method::POST, "/api/workspace/feedback", Some(body))
            .await?;
        Ok(())
    }

    /// Fetch the server's view of a workspace (port labels among others).
    pub async fn find_workspace(&self, ws_id: &str) -> Result<Option<WorkspaceFindData>> {
        let path = format!("/api/workspace/find?id={}", ws_id);
        let env: ApiEnvelope<WorkspaceFindData> =
            self.request::<_, ()>(Method::GET, &path, None).await?;
        Ok(env.data)
    }

    /// Create an operation log row; returns its id.
    pub async fn create_wslog(&self, entry: &WsLogEntry) -> Result<i64> {
        let env: ApiEnvelope<WsLogEntry> = self
            .request(Method::POST, "/api/wslog/create", Some(entry))
            .await?;
        Ok(env.data.map(|e| e.id).unwrap_or_default())
    }

    /// Update an operation log row.
    pub async fn update_wslog(&self, entry: &WsLogEntry) -> Result<()> {
        self.request::<serde_json::Value, _>(Method::PUT, "/api/wslog/update", Some(entry))
            .await?;
        Ok(())
    }

    /// Find an operation log row by workspace and title.
    pub async fn find_wslog(&self, ws_id: &str, title: &str) -> Result<Option<WsLogEntry>> {
        let path = format!("/api/wslog/find?ws_id={}&title={}", ws_id, title);
        let env: ApiEnvelope<WsLogEntry> =
            self.request::<_, ()>(Method::GET, &path, None).await?;
        Ok(env.data)
    }

    /// Authenticate and return a bearer token for later calls.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let body = serde_json::json!({ "username": username, "password": password });
        let env: ApiEnvelope<LoginData> = self
            .request(Method::POST, "/api/base/cliLogin", Some(&body))
            .await?;
        match env.data {
            Some(data) => Ok(data.token),
            None => Err(RestClientError::Api {
                code: env.code,
                msg: env.msg,
            }),
        }
    }

    async fn request<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiEnvelope<T>>
    where
        ApiEnvelope<T>: DeserializeOwned,
    {
        let url = self.base_url.join(path)?;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_status = StatusCode::INTERNAL_SERVER_ERROR;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self.http_client.request(method.clone(), url.clone());
            if let Some(token) = &self.token {
                request = request.header("x-token", token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                let text = response.text().await?;
                let envelope: ApiEnvelope<T> = serde_json::from_str(&text)?;
                if envelope.code != 0 {
                    return Err(RestClientError::Api {
                        code: envelope.code,
                        msg: envelope.msg,
                    });
                }
                return Ok(envelope);
            }

            if status.is_client_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(RestClientError::Rejected { status, body });
            }

            // 5xx: back off and retry
            last_status = status;
            if attempt < MAX_ATTEMPTS {
                warn!(%status, attempt, "control plane unavailable, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            } else {
                debug!(%status, "control plane still failing, giving up");
            }
        }

        Err(RestClientError::Unavailable {
            status: last_status,
            attempts: MAX_ATTEMPTS,
        })
    }
}
