//! Wire types of the control-plane API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard envelope of every control-plane response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Lifecycle status reported back to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedbackStatus {
    Started,
    InProgress,
    Finished,
    Failed,
}

/// Body of `POST /api/workspace/feedback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub ws_id: String,
    /// High-level command: start, stop, remove, connect.
    pub command: String,
    /// State-machine stage the report refers to.
    pub stage: String,
    pub status: FeedbackStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_ide_port: Option<u16>,
}

/// One server-side port label assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub label: String,
    pub port: u16,
}

/// Payload of `GET /api/workspace/find`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFindData {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub port_configs: Vec<PortConfig>,
}

/// One workspace operation log row (`/api/wslog/*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsLogEntry {
    #[serde(default)]
    pub id: i64,
    pub ws_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// 1 info, 2 warning, 3 debug, 4 error.
    pub level: i32,
    #[serde(default)]
    pub parent_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl WsLogEntry {
    pub fn info(ws_id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            ws_id: ws_id.into(),
            title: title.into(),
            content: content.into(),
            level: 1,
            parent_id: 0,
            start_at: now,
            end_at: now,
        }
    }
}

/// Payload of `POST /api/base/cliLogin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginData {
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_serializes_camel_case() {
        let body = FeedbackRequest {
            ws_id: "7".into(),
            command: "start".into(),
            stage: "tunneling".into(),
            status: FeedbackStatus::Finished,
            message: String::new(),
            web_ide_port: Some(6800),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["wsId"], "7");
        assert_eq!(json["status"], "finished");
        assert_eq!(json["webIdePort"], 6800);
    }

    #[test]
    fn envelope_with_missing_data_parses() {
        let json = r#"{"code": 0, "msg": "ok"}"#;
        let env: ApiEnvelope<LoginData> = serde_json::from_str(json).unwrap();
        assert_eq!(env.code, 0);
        assert!(env.data.is_none());
    }
}
