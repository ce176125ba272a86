// ABOUTME: pushes incident events to the chat channel where humans approve or ignore commands.
// ABOUTME: formats slack webhook payloads with execute/ignore buttons keyed by the command text.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use sre_agent_common::{truncate_chars, ExecutionOutcome, RiskLevel};

use crate::config::SlackConfig;

pub const LOG_LINE_PREVIEW_CHARS: usize = 500;
pub const OUTPUT_PREVIEW_CHARS: usize = 1000;
pub const IGNORE_VALUE: &str = "ignore";

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    AwaitingApproval {
        incident_id: u64,
        log_line: String,
        command: String,
        safe: bool,
        risk_level: RiskLevel,
    },
    /// Sent before an automatic run starts, or instead of it when policy blocks the command.
    AutoExecution {
        incident_id: u64,
        log_line: String,
        command: String,
        risk_level: RiskLevel,
        blocked_reason: Option<String>,
    },
    ExecutionCompleted {
        command: String,
        outcome: ExecutionOutcome,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    username: String,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("build slack http client")?;
        Ok(Self {
            client,
            webhook_url: config.webhook_url.clone(),
            username: config.username.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let payload = slack_payload(notification, &self.username);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("post slack webhook")?
            .error_for_status()
            .context("slack webhook returned an error status")?;
        Ok(())
    }
}

/// Used when no chat webhook is configured: events only reach the agent's own log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification {
            Notification::AwaitingApproval {
                incident_id,
                command,
                safe,
                risk_level,
                ..
            } => tracing::info!(incident_id, command, safe, %risk_level, "awaiting approval"),
            Notification::AutoExecution {
                incident_id,
                command,
                blocked_reason: Some(reason),
                ..
            } => tracing::warn!(incident_id, command, %reason, "automatic execution blocked"),
            Notification::AutoExecution {
                incident_id,
                command,
                risk_level,
                blocked_reason: None,
                ..
            } => tracing::info!(incident_id, command, %risk_level, "automatic execution starting"),
            Notification::ExecutionCompleted { command, outcome } => tracing::info!(
                command,
                success = outcome.success,
                output = outcome.output_preview(OUTPUT_PREVIEW_CHARS),
                "execution completed"
            ),
        }
        Ok(())
    }
}

fn risk_color(risk_level: RiskLevel) -> &'static str {
    match risk_level {
        RiskLevel::Low => "#36A64F",
        RiskLevel::Medium => "#FFA500",
        RiskLevel::High => "#FF6B6B",
        RiskLevel::Critical => "#8B0000",
    }
}

fn field(title: &str, value: String, short: bool) -> Value {
    json!({ "title": title, "value": value, "short": short })
}

fn log_field(log_line: &str) -> Value {
    field(
        "Log",
        format!("```{}```", truncate_chars(log_line, LOG_LINE_PREVIEW_CHARS)),
        false,
    )
}

pub fn slack_payload(notification: &Notification, username: &str) -> Value {
    match notification {
        Notification::AwaitingApproval {
            incident_id,
            log_line,
            command,
            safe,
            risk_level,
        } => {
            let title = if *safe {
                ":rotating_light: Incident detected, remediation proposed"
            } else {
                ":warning: Incident detected (proposed command failed security checks)"
            };
            json!({
                "username": username,
                "text": title,
                "attachments": [{
                    "callback_id": format!("incident-{incident_id}"),
                    "color": risk_color(*risk_level),
                    "fields": [
                        log_field(log_line),
                        field(&format!("Proposed command (risk: {risk_level})"), format!("`{command}`"), false),
                    ],
                    "actions": [
                        {
                            "name": "execute",
                            "text": "Execute",
                            "type": "button",
                            "value": command,
                            "style": "primary",
                        },
                        {
                            "name": "ignore",
                            "text": "Ignore",
                            "type": "button",
                            "value": IGNORE_VALUE,
                            "style": "danger",
                        },
                    ],
                }],
            })
        }
        Notification::AutoExecution {
            log_line,
            command,
            risk_level,
            blocked_reason: Some(reason),
            ..
        } => json!({
            "username": username,
            "text": ":warning: *Automatic remediation blocked (security risk)*",
            "attachments": [{
                "color": risk_color(RiskLevel::Critical),
                "fields": [
                    log_field(log_line),
                    field("Blocked command", format!("`{command}`"), false),
                    field("Reason", reason.clone(), false),
                    field("Risk", risk_level.to_string(), true),
                ],
            }],
        }),
        Notification::AutoExecution {
            log_line,
            command,
            risk_level,
            blocked_reason: None,
            ..
        } => json!({
            "username": username,
            "text": ":zap: *Automatic remediation running*",
            "attachments": [{
                "color": risk_color(RiskLevel::Medium),
                "fields": [
                    log_field(log_line),
                    field("Command", format!("`{command}`"), false),
                    field("Risk", risk_level.to_string(), true),
                ],
            }],
        }),
        Notification::ExecutionCompleted { command, outcome } => {
            let (icon, status, color) = if outcome.success {
                (":white_check_mark:", "succeeded", "#36A64F")
            } else {
                (":x:", "failed", "#FF6B6B")
            };
            json!({
                "username": username,
                "text": format!("{icon} *Command {status}*"),
                "attachments": [{
                    "color": color,
                    "fields": [
                        field("Command", format!("`{command}`"), false),
                        field(
                            "Output",
                            format!("```{}```", outcome.output_preview(OUTPUT_PREVIEW_CHARS)),
                            false,
                        ),
                    ],
                }],
            })
        }
    }
}
