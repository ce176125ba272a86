// ABOUTME: runs one approved command through the shell with a hard wall-clock limit.
// ABOUTME: turns every failure mode (non-zero exit, timeout, spawn fault) into an ExecutionOutcome.

use std::process::Stdio;
use std::time::Duration;

use sre_agent_common::{ExecutionOutcome, PolicyEngine};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const SHELL: &str = "/bin/sh";
const MAX_STDIO_BYTES: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("security check failed: {reason}")]
pub struct SecurityRejection {
    pub reason: String,
    pub rule: Option<String>,
}

/// Executes shell commands. `execute` blocks its task for at most the configured timeout
/// plus the time needed to kill and reap the process group, so request handlers should
/// await it from a spawned task rather than inline on an accept loop.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(&self, command: &str) -> ExecutionOutcome {
        if command.trim().is_empty() {
            return ExecutionOutcome::failure("empty command");
        }

        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn shell");
                return ExecutionOutcome::failure(format!("execution error: {err}"));
            }
        };
        let pid = child.id();
        tracing::info!(pid, command, "command started");

        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let waited = tokio::time::timeout(self.timeout, async {
            let status = child.wait().await?;
            let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);
            Ok::<_, std::io::Error>((status, stdout.unwrap_or_default(), stderr.unwrap_or_default()))
        })
        .await;

        match waited {
            Ok(Ok((status, stdout, stderr))) => {
                let output = if stdout.is_empty() { stderr } else { stdout };
                tracing::info!(pid, exit_code = status.code(), "command finished");
                ExecutionOutcome {
                    success: status.success(),
                    output: output.trim().to_string(),
                    exit_code: status.code(),
                    timed_out: false,
                }
            }
            Ok(Err(err)) => {
                terminate(pid, &mut child).await;
                ExecutionOutcome::failure(format!("execution error: {err}"))
            }
            Err(_) => {
                terminate(pid, &mut child).await;
                tracing::warn!(pid, timeout = ?self.timeout, "command timed out and was killed");
                ExecutionOutcome {
                    success: false,
                    output: format!("command timed out after {}", describe(self.timeout)),
                    exit_code: None,
                    timed_out: true,
                }
            }
        }
    }

    /// Evaluates `command` against the current deny-list snapshot immediately before running it.
    pub async fn execute_with_policy(
        &self,
        command: &str,
        policy: &PolicyEngine,
    ) -> Result<ExecutionOutcome, SecurityRejection> {
        let verdict = policy.evaluate(command);
        if !verdict.safe {
            return Err(SecurityRejection {
                reason: verdict
                    .reason
                    .unwrap_or_else(|| "rejected by policy".to_string()),
                rule: verdict.rule,
            });
        }
        Ok(self.execute(command).await)
    }
}

/// Kills the whole process group, then kills and reaps the shell itself.
async fn terminate(pid: Option<u32>, child: &mut Child) {
    if let Some(pid) = pid {
        // The child was spawned as the leader of its own process group.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            tracing::debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    if let Err(err) = child.kill().await {
        tracing::warn!(?pid, error = %err, "failed to reap timed out command");
    }
}

async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let room = MAX_STDIO_BYTES.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }

    let mut out = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        out.push_str("\n[truncated]");
    }
    out
}

fn describe(timeout: Duration) -> String {
    if timeout.subsec_nanos() == 0 {
        format!("{} seconds", timeout.as_secs())
    } else {
        format!("{} ms", timeout.as_millis())
    }
}
