// ABOUTME: writes append-only audit records for each request received on the control socket.
// ABOUTME: records who asked (peer credentials), what they asked, and the redacted answer.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use sre_agent_common::{AgentRequest, AgentResponse};
use tokio::io::AsyncWriteExt;

const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, serde::Serialize)]
struct AuditRecord<'a> {
    ts_unix_ms: u64,
    peer: Option<PeerCredentials>,
    request_id: &'a str,
    request: Value,
    response: Value,
}

pub async fn append_record(
    audit_path: &Path,
    ts_unix_ms: u64,
    peer: Option<PeerCredentials>,
    request: &AgentRequest,
    response: &AgentResponse,
) -> anyhow::Result<()> {
    let record = AuditRecord {
        ts_unix_ms,
        peer,
        request_id: request.request_id.as_str(),
        request: serde_json::to_value(request)?,
        response: redact_response(response)?,
    };

    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_path)
        .await
        .with_context(|| format!("open audit log at {}", audit_path.display()))?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

/// Command output never reaches the audit log; exit status and the command itself do.
fn redact_response(response: &AgentResponse) -> anyhow::Result<Value> {
    let mut v = serde_json::to_value(response)?;
    let Some(result) = v.get_mut("result").and_then(Value::as_object_mut) else {
        return Ok(v);
    };

    let kind = result.get("type").and_then(Value::as_str).map(str::to_owned);
    match kind.as_deref() {
        Some("executed") => {
            if let Some(outcome) = result.get_mut("outcome") {
                redact_output(outcome);
            }
        }
        Some("incidents") => {
            if let Some(incidents) = result.get_mut("incidents").and_then(Value::as_array_mut) {
                for incident in incidents {
                    if let Some(outcome) = incident.get_mut("outcome") {
                        redact_output(outcome);
                    }
                }
            }
        }
        _ => {}
    }
    Ok(v)
}

fn redact_output(outcome: &mut Value) {
    if let Some(obj) = outcome.as_object_mut() {
        if obj.contains_key("output") {
            obj.insert("output".to_string(), Value::String(REDACTED.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use sre_agent_common::{Action, ActionResult, ExecutionOutcome};

    use super::*;

    fn executed_response() -> AgentResponse {
        AgentResponse {
            request_id: "req-1".to_string(),
            result: Some(ActionResult::Executed {
                command: "cat /etc/app.env".to_string(),
                outcome: ExecutionOutcome {
                    success: true,
                    output: "API_TOKEN=hunter2".to_string(),
                    exit_code: Some(0),
                    timed_out: false,
                },
            }),
            error: None,
        }
    }

    #[test]
    fn executed_output_is_redacted() {
        let v = redact_response(&executed_response()).unwrap();
        assert_eq!(v["result"]["outcome"]["output"], REDACTED);
        assert_eq!(v["result"]["outcome"]["exit_code"], 0);
        assert_eq!(v["result"]["command"], "cat /etc/app.env");
    }

    #[test]
    fn error_responses_pass_through() {
        let response = AgentResponse {
            request_id: "unknown".to_string(),
            result: None,
            error: Some(sre_agent_common::RequestError {
                code: sre_agent_common::ErrorCode::ParseFailed,
                message: "parse failed".to_string(),
            }),
        };
        let v = redact_response(&response).unwrap();
        assert_eq!(v["error"]["code"], "parse_failed");
    }

    #[tokio::test]
    async fn append_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");
        let request = AgentRequest {
            request_id: "req-1".to_string(),
            action: Action::Ping,
        };

        append_record(&path, 1, None, &request, &executed_response())
            .await
            .unwrap();
        append_record(&path, 2, None, &request, &executed_response())
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(!text.contains("hunter2"));
        let v: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["ts_unix_ms"], 2);
        assert_eq!(v["request"]["action"]["type"], "ping");
    }
}
