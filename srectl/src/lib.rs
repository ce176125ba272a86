// ABOUTME: provides srectl helpers for building, parsing, and validating control requests.
// ABOUTME: also runs the command safety policy locally so operators can vet a command offline.

use std::path::Path;

use sre_agent_common::{
    parse_request, validate_request, Action, AgentRequest, ErrorCode, KeywordList, PolicyEngine,
    ReloadableKeywords, RequestError, RiskLevel,
};

pub fn default_request_id(action: &Action) -> String {
    let name = match action {
        Action::Ping => "ping",
        Action::Approve(_) => "approve",
        Action::Ignore(_) => "ignore",
        Action::Check(_) => "check",
        Action::Reload => "reload",
        Action::Incidents(_) => "incidents",
        Action::Stats(_) => "stats",
        Action::Prompt(_) => "prompt",
    };
    format!("srectl-{name}-{}", std::process::id())
}

/// Wraps `action` in a request and refuses anything the daemon would refuse.
pub fn build_request(request_id: Option<&str>, action: Action) -> anyhow::Result<AgentRequest> {
    let request_id = match request_id {
        Some(id) => id.to_string(),
        None => default_request_id(&action),
    };
    let request = AgentRequest { request_id, action };
    validate_request(&request).map_err(|e| anyhow::anyhow!(e.message))?;
    Ok(request)
}

pub fn parse_and_validate(input: &str, request_id: Option<&str>) -> anyhow::Result<AgentRequest> {
    let mut request = parse_request(input)?;
    if let Some(request_id) = request_id {
        if request_id.trim().is_empty() {
            return Err(anyhow::anyhow!("request_id override must be non-empty"));
        }
        request.request_id = request_id.to_string();
    }
    validate_request(&request).map_err(|e| anyhow::anyhow!(e.message))?;
    Ok(request)
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
pub struct ValidateVerdict {
    pub ok: bool,
    pub error: Option<RequestError>,
}

pub fn validate_verdict(input: &str) -> ValidateVerdict {
    match parse_request(input) {
        Ok(request) => match validate_request(&request) {
            Ok(()) => ValidateVerdict {
                ok: true,
                error: None,
            },
            Err(err) => ValidateVerdict {
                ok: false,
                error: Some(RequestError {
                    code: ErrorCode::ValidationFailed,
                    message: err.message,
                }),
            },
        },
        Err(err) => ValidateVerdict {
            ok: false,
            error: Some(RequestError {
                code: ErrorCode::ParseFailed,
                message: err.to_string(),
            }),
        },
    }
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
pub struct LocalVerdict {
    pub command: String,
    pub safe: bool,
    pub reason: Option<String>,
    pub rule: Option<String>,
    pub risk_level: RiskLevel,
    pub deny_keywords: usize,
}

/// Evaluates `command` without a daemon. With no deny-list only the built-in rules apply.
pub fn local_verdict(command: &str, deny_list: Option<&Path>) -> LocalVerdict {
    let keywords = match deny_list {
        Some(path) => ReloadableKeywords::open(path, "deny-list"),
        None => ReloadableKeywords::fixed(KeywordList::default(), "deny-list"),
    };
    let policy = PolicyEngine::new(keywords);
    let verdict = policy.evaluate(command);
    LocalVerdict {
        command: command.to_string(),
        safe: verdict.safe,
        reason: verdict.reason,
        rule: verdict.rule,
        risk_level: policy.risk_level(command),
        deny_keywords: policy.deny_keyword_count(),
    }
}
