// ABOUTME: defines the shared types exchanged between srectl, sre-agentd, and the incident ledger.
// ABOUTME: provides request parsing and validation so both ends agree on what is well-formed.

pub mod keywords;
pub mod policy;
pub mod sanitize;
pub mod stats;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use keywords::{KeywordList, KeywordListError, ReloadableKeywords};
pub use policy::{PolicyEngine, Verdict};
pub use sanitize::sanitize;
pub use stats::{DailyCount, IncidentStats};

pub const MAX_INCIDENT_LIMIT: usize = 1000;
pub const MAX_STATS_DAYS: u32 = 365;
pub const MAX_PROMPT_CHARS: usize = 4000;

/// Coarse severity of a command. `Critical` is reserved for commands that failed policy
/// evaluation; `High` is part of the scale but no current rule produces it.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            exit_code: None,
            timed_out: false,
        }
    }

    pub fn output_preview(&self, max_chars: usize) -> &str {
        truncate_chars(&self.output, max_chars)
    }
}

/// Returns the longest prefix of `s` holding at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// What the orchestrator knows about an incident before anything runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewIncident {
    pub log_line: String,
    pub command: String,
    pub auto_executed: bool,
    pub safe: bool,
    pub risk_level: RiskLevel,
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub log_line: String,
    pub command: String,
    pub auto_executed: bool,
    pub safe: bool,
    pub risk_level: RiskLevel,
    pub block_reason: Option<String>,
    pub executed: bool,
    pub outcome: Option<ExecutionOutcome>,
    pub execution_timestamp: Option<DateTime<Utc>>,
}

impl IncidentRecord {
    pub fn open(id: u64, timestamp: DateTime<Utc>, incident: NewIncident) -> Self {
        Self {
            id,
            timestamp,
            log_line: incident.log_line,
            command: incident.command,
            auto_executed: incident.auto_executed,
            safe: incident.safe,
            risk_level: incident.risk_level,
            block_reason: incident.block_reason,
            executed: false,
            outcome: None,
            execution_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentRequest {
    pub request_id: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Ping,
    Approve(ApproveAction),
    Ignore(IgnoreAction),
    Check(CheckAction),
    Reload,
    Incidents(IncidentsAction),
    Stats(StatsAction),
    Prompt(PromptAction),
}

/// A human clicked "execute". The command is the exact string handed to the notifier and
/// carries no more trust than a freshly proposed one.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApproveAction {
    pub command: String,
    #[serde(default)]
    pub incident_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IgnoreAction {
    #[serde(default)]
    pub incident_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CheckAction {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IncidentsAction {
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StatsAction {
    pub days: u32,
}

/// Reads the proposer's system prompt, or replaces it when `text` is present.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PromptAction {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentResponse {
    pub request_id: String,
    pub result: Option<ActionResult>,
    pub error: Option<RequestError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionResult {
    Pong,
    Executed {
        command: String,
        outcome: ExecutionOutcome,
    },
    Rejected {
        command: String,
        reason: String,
    },
    Ignored {
        incident_id: Option<u64>,
    },
    Verdict {
        command: String,
        safe: bool,
        reason: Option<String>,
        rule: Option<String>,
        risk_level: RiskLevel,
    },
    Reloaded {
        deny_keywords: usize,
        auto_keywords: usize,
    },
    Incidents {
        incidents: Vec<IncidentRecord>,
    },
    Stats(IncidentStats),
    Prompt {
        text: String,
        updated: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseFailed,
    ValidationFailed,
    RequestTooLarge,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn parse_request(input: &str) -> Result<AgentRequest, serde_json::Error> {
    serde_json::from_str(input)
}

pub fn validate_request(request: &AgentRequest) -> Result<(), ValidationError> {
    if request.request_id.trim().is_empty() {
        return Err(ValidationError::new("request_id must be non-empty"));
    }

    match &request.action {
        Action::Incidents(incidents) => {
            if incidents.limit == 0 || incidents.limit > MAX_INCIDENT_LIMIT {
                return Err(ValidationError::new(format!(
                    "limit must be between 1 and {MAX_INCIDENT_LIMIT}"
                )));
            }
        }
        Action::Stats(stats) => {
            if stats.days == 0 || stats.days > MAX_STATS_DAYS {
                return Err(ValidationError::new(format!(
                    "days must be between 1 and {MAX_STATS_DAYS}"
                )));
            }
        }
        Action::Prompt(PromptAction { text: Some(text) }) => {
            if text.trim().is_empty() {
                return Err(ValidationError::new("prompt text must be non-empty"));
            }
            if text.chars().count() > MAX_PROMPT_CHARS {
                return Err(ValidationError::new(format!(
                    "prompt text must be at most {MAX_PROMPT_CHARS} characters"
                )));
            }
        }
        Action::Ping
        | Action::Prompt(PromptAction { text: None })
        | Action::Approve(_)
        | Action::Ignore(_)
        | Action::Check(_)
        | Action::Reload => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_fields_in_approve_action() {
        let input = r#"
        {
          "request_id": "req-1",
          "action": {
            "type": "approve",
            "command": "df -h",
            "unexpected": "hallucination"
          }
        }
        "#;

        assert!(parse_request(input).is_err());
    }

    #[test]
    fn parse_accepts_approve_without_incident_id() {
        let input = r#"{"request_id":"req-1","action":{"type":"approve","command":"df -h"}}"#;
        let request = parse_request(input).unwrap();
        assert_eq!(
            request.action,
            Action::Approve(ApproveAction {
                command: "df -h".to_string(),
                incident_id: None,
            })
        );
    }

    #[test]
    fn validate_rejects_blank_request_id() {
        let input = r#"{"request_id":"   ","action":{"type":"ping"}}"#;
        let request = parse_request(input).unwrap();
        let err = validate_request(&request).unwrap_err();
        assert!(err.message.contains("request_id"));
    }

    #[test]
    fn validate_bounds_incident_limit_and_stats_window() {
        let zero_limit = parse_request(
            r#"{"request_id":"r","action":{"type":"incidents","limit":0}}"#,
        )
        .unwrap();
        assert!(validate_request(&zero_limit).is_err());

        let long_window =
            parse_request(r#"{"request_id":"r","action":{"type":"stats","days":366}}"#).unwrap();
        assert!(validate_request(&long_window).is_err());

        let ok = parse_request(r#"{"request_id":"r","action":{"type":"stats","days":7}}"#).unwrap();
        validate_request(&ok).unwrap();
    }

    #[test]
    fn validate_bounds_prompt_text() {
        let read = parse_request(r#"{"request_id":"r","action":{"type":"prompt"}}"#).unwrap();
        assert_eq!(read.action, Action::Prompt(PromptAction { text: None }));
        validate_request(&read).unwrap();

        let blank =
            parse_request(r#"{"request_id":"r","action":{"type":"prompt","text":" \n"}}"#)
                .unwrap();
        assert!(validate_request(&blank).is_err());

        let at_limit = AgentRequest {
            request_id: "r".to_string(),
            action: Action::Prompt(PromptAction {
                text: Some("é".repeat(MAX_PROMPT_CHARS)),
            }),
        };
        validate_request(&at_limit).unwrap();

        let too_long = AgentRequest {
            request_id: "r".to_string(),
            action: Action::Prompt(PromptAction {
                text: Some("x".repeat(MAX_PROMPT_CHARS + 1)),
            }),
        };
        let err = validate_request(&too_long).unwrap_err();
        assert!(err.message.contains("at most"));
    }

    #[test]
    fn risk_level_orders_and_serializes_uppercase() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(
            serde_json::to_string(&RiskLevel::Critical).unwrap(),
            "\"CRITICAL\""
        );
    }

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
