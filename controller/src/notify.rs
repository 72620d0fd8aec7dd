//! Notification sink
//!
//! Notifications are strictly best-effort: every failure is reported to the
//! caller for logging and metrics, and none of them ever affects control
//! flow. The Slack sink posts severity-colored attachments via the chat API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::SlackConfig;
use crate::detection::{Issue, Severity};
use crate::remediation::RemediationOutcome;

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Notification errors. Observed, logged, counted; never fatal.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("slack api error: {0}")]
    Slack(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outbound notification port.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_issue(&self, issue: &Issue) -> Result<(), NotifyError>;

    async fn notify_remediation(
        &self,
        issue: &Issue,
        outcome: &RemediationOutcome,
    ) -> Result<(), NotifyError>;

    async fn notify_startup(&self, version: &str) -> Result<(), NotifyError>;

    async fn test_connection(&self) -> Result<(), NotifyError>;
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Slack notification sink.
pub struct SlackNotifier {
    client: reqwest::Client,
    config: SlackConfig,
    api_base: String,
}

impl SlackNotifier {
    #[must_use]
    pub fn new(config: SlackConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            api_base: SLACK_API_BASE.to_string(),
        }
    }

    /// Override the API base URL (used by tests against a local server).
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn severity_color(severity: Severity) -> &'static str {
        match severity {
            Severity::Critical => "danger",
            Severity::High => "warning",
            Severity::Medium => "#ff9900",
            Severity::Low => "good",
        }
    }

    async fn post_message(
        &self,
        text: &str,
        attachment: serde_json::Value,
    ) -> Result<(), NotifyError> {
        let payload = json!({
            "channel": self.config.channel,
            "username": self.config.username,
            "icon_emoji": self.config.icon_emoji,
            "text": text,
            "attachments": [attachment],
        });

        let response: SlackResponse = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(&self.config.token)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(NotifyError::Slack(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        debug!(channel = self.config.channel, "sent slack message");
        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify_issue(&self, issue: &Issue) -> Result<(), NotifyError> {
        let attachment = json!({
            "color": Self::severity_color(issue.severity),
            "title": format!("Guardian alert: {}", issue.rule_name),
            "text": issue.description,
            "fields": [
                { "title": "Resource", "value": format!("{}/{}", issue.kind, issue.name), "short": true },
                { "title": "Namespace", "value": issue.namespace, "short": true },
                { "title": "Severity", "value": issue.severity.as_str().to_uppercase(), "short": true },
                { "title": "Detected At", "value": issue.detected_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(), "short": true },
                {
                    "title": "Actions",
                    "value": issue.actions.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", "),
                    "short": false
                },
            ],
            "footer": "Guardian",
            "ts": issue.detected_at.timestamp(),
        });

        self.post_message("Issue detected in cluster", attachment).await?;
        info!(rule = issue.rule_name, resource = issue.name, "sent issue notification");
        Ok(())
    }

    async fn notify_remediation(
        &self,
        issue: &Issue,
        outcome: &RemediationOutcome,
    ) -> Result<(), NotifyError> {
        let color = if outcome.success { "good" } else { "danger" };
        let status = if outcome.success { "Success" } else { "Failed" };

        let attachment = json!({
            "color": color,
            "title": format!("Guardian action: {}", outcome.action),
            "text": outcome.message,
            "fields": [
                { "title": "Resource", "value": format!("{}/{}", issue.kind, issue.name), "short": true },
                { "title": "Namespace", "value": outcome.namespace, "short": true },
                { "title": "Status", "value": status, "short": true },
                { "title": "Duration", "value": format!("{:?}", outcome.duration), "short": true },
                { "title": "Issue", "value": issue.rule_name, "short": true },
                {
                    "title": "Executed At",
                    "value": outcome.executed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    "short": true
                },
            ],
            "footer": "Guardian",
            "ts": outcome.executed_at.timestamp(),
        });

        self.post_message("Remediation action executed", attachment).await?;
        info!(
            action = %outcome.action,
            resource = outcome.resource,
            success = outcome.success,
            "sent remediation notification"
        );
        Ok(())
    }

    async fn notify_startup(&self, version: &str) -> Result<(), NotifyError> {
        let attachment = json!({
            "color": "good",
            "title": "Guardian started",
            "text": format!("Guardian v{version} is now monitoring the cluster"),
            "fields": [
                { "title": "Version", "value": version, "short": true },
                { "title": "Status", "value": "Active", "short": true },
            ],
            "footer": "Guardian",
        });

        self.post_message("Guardian started", attachment).await
    }

    async fn test_connection(&self) -> Result<(), NotifyError> {
        let response: SlackResponse = self
            .client
            .post(format!("{}/auth.test", self.api_base))
            .bearer_auth(&self.config.token)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(NotifyError::Slack(
                response.error.unwrap_or_else(|| "auth test failed".to_string()),
            ));
        }
        Ok(())
    }
}
