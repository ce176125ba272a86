// ABOUTME: hosts the unix control socket where operators and chat callbacks approve, ignore, or query.
// ABOUTME: enforces strict parsing and validation, dispatches actions, and audits every handled request.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use sre_agent_common::{
    parse_request, validate_request, Action, ActionResult, AgentRequest, AgentResponse, ErrorCode,
    ReloadableKeywords, RequestError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::audit;
use crate::orchestrator::Remediator;
use crate::proposer;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
#[cfg(test)]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(50);
#[cfg(not(test))]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

pub struct ServerContext {
    pub remediator: Arc<Remediator>,
    pub auto_keywords: Arc<ReloadableKeywords>,
    pub audit_path: PathBuf,
    pub prompt_file: PathBuf,
}

pub async fn run(socket_path: &Path, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("remove existing socket at {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;
    tracing::info!(socket = %socket_path.display(), "control socket listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        // Approved commands run inside this task, never on the accept loop.
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, &ctx).await {
                tracing::warn!(error = %err, "client connection failed");
            }
        });
    }
}

async fn handle_client(mut stream: UnixStream, ctx: &ServerContext) -> anyhow::Result<()> {
    let peer = peer_credentials(&stream);

    let mut input = Vec::new();
    let mut buf = [0u8; 4096];
    let mut exceeded = false;
    let mut idle = false;
    loop {
        let n = match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                idle = true;
                break;
            }
        };
        if n == 0 {
            break;
        }
        if exceeded {
            continue;
        }
        if input.len() + n > MAX_REQUEST_BYTES {
            exceeded = true;
            continue;
        }
        input.extend_from_slice(&buf[..n]);
    }

    if exceeded {
        return write_request_error(
            &mut stream,
            "unknown",
            ErrorCode::RequestTooLarge,
            "request exceeds max bytes",
        )
        .await;
    }

    if idle && input.is_empty() {
        return write_request_error(&mut stream, "unknown", ErrorCode::ParseFailed, "read timed out")
            .await;
    }

    let input_str = String::from_utf8_lossy(&input);
    let request = match parse_request(&input_str) {
        Ok(r) => r,
        Err(err) => {
            return write_request_error(
                &mut stream,
                "unknown",
                ErrorCode::ParseFailed,
                &format!("parse failed: {err}"),
            )
            .await;
        }
    };

    if let Err(err) = validate_request(&request) {
        return write_request_error(
            &mut stream,
            &request.request_id,
            ErrorCode::ValidationFailed,
            &format!("validation failed: {}", err.message),
        )
        .await;
    }

    tracing::debug!(request_id = %request.request_id, ?peer, "request received");
    let response = match dispatch(&request, ctx).await {
        Ok(result) => AgentResponse {
            request_id: request.request_id.clone(),
            result: Some(result),
            error: None,
        },
        Err(err) => {
            tracing::error!(request_id = %request.request_id, error = %err, "request failed");
            AgentResponse {
                request_id: request.request_id.clone(),
                result: None,
                error: Some(RequestError {
                    code: ErrorCode::Internal,
                    message: format!("{err:#}"),
                }),
            }
        }
    };

    let response_json = serde_json::to_vec(&response)?;
    stream.write_all(&response_json).await?;
    stream.shutdown().await?;

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    audit::append_record(&ctx.audit_path, now_ms, peer, &request, &response).await?;

    Ok(())
}

async fn dispatch(request: &AgentRequest, ctx: &ServerContext) -> anyhow::Result<ActionResult> {
    let remediator = &ctx.remediator;
    let result = match &request.action {
        Action::Ping => ActionResult::Pong,
        Action::Approve(approve) => {
            match remediator.approve(&approve.command, approve.incident_id).await {
                Ok(outcome) => ActionResult::Executed {
                    command: approve.command.clone(),
                    outcome,
                },
                Err(rejection) => ActionResult::Rejected {
                    command: approve.command.clone(),
                    reason: rejection.to_string(),
                },
            }
        }
        Action::Ignore(ignore) => {
            tracing::info!(incident_id = ?ignore.incident_id, "proposed command ignored by operator");
            ActionResult::Ignored {
                incident_id: ignore.incident_id,
            }
        }
        Action::Check(check) => {
            let verdict = remediator.policy().evaluate(&check.command);
            ActionResult::Verdict {
                command: check.command.clone(),
                safe: verdict.safe,
                reason: verdict.reason,
                rule: verdict.rule,
                risk_level: remediator.policy().risk_level(&check.command),
            }
        }
        Action::Reload => ActionResult::Reloaded {
            deny_keywords: remediator.policy().reload(),
            auto_keywords: ctx.auto_keywords.reload(),
        },
        Action::Incidents(incidents) => ActionResult::Incidents {
            incidents: remediator.ledger().recent(incidents.limit).await?,
        },
        Action::Stats(stats) => ActionResult::Stats(remediator.ledger().statistics(stats.days).await?),
        Action::Prompt(prompt) => match &prompt.text {
            Some(text) => {
                proposer::store_system_prompt(&ctx.prompt_file, text).await?;
                ActionResult::Prompt {
                    text: proposer::load_system_prompt(&ctx.prompt_file).await,
                    updated: true,
                }
            }
            None => ActionResult::Prompt {
                text: proposer::load_system_prompt(&ctx.prompt_file).await,
                updated: false,
            },
        },
    };
    Ok(result)
}

fn peer_credentials(stream: &UnixStream) -> Option<audit::PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 || len as usize != std::mem::size_of::<libc::ucred>() {
        return None;
    }

    Some(audit::PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

async fn write_request_error(
    stream: &mut UnixStream,
    request_id: &str,
    code: ErrorCode,
    message: &str,
) -> anyhow::Result<()> {
    tracing::info!(request_id, ?code, message, "request refused");
    let response = AgentResponse {
        request_id: request_id.to_string(),
        result: None,
        error: Some(RequestError {
            code,
            message: message.to_string(),
        }),
    };
    let response_json = serde_json::to_vec(&response)?;
    stream.write_all(&response_json).await?;
    let _ = stream.shutdown().await;
    Ok(())
}
