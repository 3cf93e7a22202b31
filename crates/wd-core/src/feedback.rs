//! Control-plane feedback. Transport failures are logged, never fatal: a
//! workspace must come up even when the control plane is down.

use tracing::warn;

use wd_rest_client::{FeedbackRequest, FeedbackStatus, RestClient, WsLogEntry};
use wd_workspace::Stage;

/// Posts lifecycle feedback for one command when a callback address is
/// configured; a no-op otherwise.
pub struct Feedback {
    client: Option<RestClient>,
    command: String,
}

impl Feedback {
    pub fn new(client: Option<RestClient>, command: &str) -> Self {
        Self {
            client,
            command: command.to_string(),
        }
    }

    pub fn disabled(command: &str) -> Self {
        Self::new(None, command)
    }

    fn op_title(&self) -> &'static str {
        match self.command.as_str() {
            "start" => "workspace start",
            "stop" => "workspace stop",
            "remove" => "workspace remove",
            "connect" => "workspace connect",
            _ => "workspace operation",
        }
    }

    async fn wslog(&self, ws_id: &str, content: &str, level: i32) {
        let client = match &self.client {
            Some(client) if !ws_id.is_empty() => client,
            _ => return,
        };
        let mut entry = WsLogEntry::info(ws_id, self.op_title(), content);
        entry.level = level;
        if let Err(e) = client.create_wslog(&entry).await {
            warn!(error = %e, "wslog post failed, continuing");
        }
    }

    /// Stamp the operation's log row closed; falls back to a fresh row
    /// when the server has none.
    async fn wslog_close(&self, ws_id: &str, content: &str, level: i32) {
        let client = match &self.client {
            Some(client) if !ws_id.is_empty() => client,
            _ => return,
        };
        if let Ok(Some(mut entry)) = client.find_wslog(ws_id, self.op_title()).await {
            entry.content = content.to_string();
            entry.level = level;
            entry.end_at = chrono::Utc::now();
            if let Err(e) = client.update_wslog(&entry).await {
                warn!(error = %e, "wslog update failed, continuing");
            }
            return;
        }
        self.wslog(ws_id, content, level).await;
    }

    pub async fn started(&self, ws_id: &str) {
        self.post(ws_id, "start", FeedbackStatus::Started, "", None).await;
        self.wslog(ws_id, "", 1).await;
    }

    pub async fn in_progress(&self, ws_id: &str, stage: Stage) {
        self.post(ws_id, stage.as_str(), FeedbackStatus::InProgress, "", None)
            .await;
    }

    /// The one terminal success event; carries the web IDE port.
    pub async fn finished(&self, ws_id: &str, web_ide_port: Option<u16>) {
        self.post(ws_id, "finish", FeedbackStatus::Finished, "", web_ide_port)
            .await;
        self.wslog_close(ws_id, "finished", 1).await;
    }

    /// The one terminal failure event.
    pub async fn failed(&self, ws_id: &str, stage: &str, message: &str) {
        self.post(ws_id, stage, FeedbackStatus::Failed, message, None)
            .await;
        self.wslog_close(ws_id, message, 4).await;
    }

    async fn post(
        &self,
        ws_id: &str,
        stage: &str,
        status: FeedbackStatus,
        message: &str,
        web_ide_port: Option<u16>,
    ) {
        let client = match &self.client {
            Some(client) => client,
            None => return,
        };
        let body = FeedbackRequest {
            ws_id: ws_id.to_string(),
            command: self.command.clone(),
            stage: stage.to_string(),
            status,
            message: message.to_string(),
            web_ide_port,
        };
        if let Err(e) = client.post_feedback(&body).await {
            warn!(error = %e, stage, "feedback post failed, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_feedback_is_a_no_op() {
        let feedback = Feedback::disabled("start");
        feedback.started("1").await;
        feedback.finished("1", Some(6800)).await;
    }

    #[tokio::test]
    async fn unreachable_control_plane_does_not_fail_the_operation() {
        // nothing listens on this port; every post must swallow the error
        let client = RestClient::from_url("http://127.0.0.1:9/", None).unwrap();
        let feedback = Feedback::new(Some(client), "start");
        feedback.started("1").await;
        feedback.in_progress("1", Stage::Launching).await;
        feedback.failed("1", "launching", "boom").await;
    }
}
