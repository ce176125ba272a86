// ABOUTME: follows the system journal or a log file and emits qualifying error lines.
// ABOUTME: tags each line as auto-execute when it contains an operator-listed trigger keyword.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use sre_agent_common::ReloadableKeywords;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::{MonitoringConfig, SourceKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub line: String,
    pub auto: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    Journal { levels: Vec<String> },
    File {
        path: PathBuf,
        error_keywords: Vec<String>,
    },
}

impl LogSource {
    pub fn from_config(config: &MonitoringConfig) -> anyhow::Result<Self> {
        match config.source {
            SourceKind::Journal => Ok(LogSource::Journal {
                levels: config.error_levels.clone(),
            }),
            SourceKind::File => {
                let path = config
                    .log_path
                    .clone()
                    .context("monitoring.log_path is required for file monitoring")?;
                Ok(LogSource::File {
                    path,
                    error_keywords: config.error_keywords.clone(),
                })
            }
        }
    }

    fn command(&self) -> Command {
        match self {
            LogSource::Journal { levels } => {
                let first = levels.first().map(String::as_str).unwrap_or("err");
                let last = levels.last().map(String::as_str).unwrap_or("emerg");
                let priorities = format!("{first}..{last}");
                let mut cmd = Command::new("journalctl");
                cmd.args(["-f", "-n", "0", "-p", priorities.as_str()]);
                cmd
            }
            LogSource::File { path, .. } => {
                let mut cmd = Command::new("tail");
                cmd.args(["-F", "-n", "0"]).arg(path);
                cmd
            }
        }
    }

    /// Journal lines are already filtered by priority; file lines must name an error keyword.
    fn qualifies(&self, line: &str) -> bool {
        match self {
            LogSource::Journal { .. } => true,
            LogSource::File { error_keywords, .. } => {
                let upper = line.to_uppercase();
                error_keywords
                    .iter()
                    .any(|keyword| upper.contains(&keyword.to_uppercase()))
            }
        }
    }
}

pub struct LogMonitor {
    source: LogSource,
    auto_keywords: Arc<ReloadableKeywords>,
}

impl LogMonitor {
    pub fn new(source: LogSource, auto_keywords: Arc<ReloadableKeywords>) -> Self {
        Self {
            source,
            auto_keywords,
        }
    }

    pub fn classify(&self, raw: &str) -> Option<LogEvent> {
        let line = raw.trim();
        if line.is_empty() || !self.source.qualifies(line) {
            return None;
        }
        Some(LogEvent {
            line: line.to_string(),
            auto: self.auto_keywords.snapshot().contains_match(line),
        })
    }

    /// Spawns the follower process and forwards events until it exits or the receiver
    /// is dropped.
    pub async fn run(&self, tx: mpsc::Sender<LogEvent>) -> anyhow::Result<()> {
        let mut cmd = self.source.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn log follower for {:?}", self.source))?;
        let stdout = child
            .stdout
            .take()
            .context("log follower has no stdout")?;

        tracing::info!(source = ?self.source, "monitoring started");
        self.follow(BufReader::new(stdout), &tx).await?;

        let status = child.wait().await?;
        tracing::warn!(%status, "log follower exited; monitoring stopped");
        Ok(())
    }

    /// Lines that are not valid UTF-8 are decoded lossily rather than ending the stream.
    pub async fn follow<R: AsyncBufRead + Unpin>(
        &self,
        mut reader: R,
        tx: &mpsc::Sender<LogEvent>,
    ) -> anyhow::Result<()> {
        let mut raw = Vec::new();
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&raw);
            let Some(event) = self.classify(&line) else {
                continue;
            };
            if tx.send(event).await.is_err() {
                tracing::debug!("event receiver dropped; stopping log follower");
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sre_agent_common::KeywordList;

    use super::*;

    fn file_monitor(auto: &str) -> LogMonitor {
        LogMonitor::new(
            LogSource::File {
                path: PathBuf::from("/var/log/app.log"),
                error_keywords: vec!["ERROR".to_string(), "FATAL".to_string()],
            },
            Arc::new(ReloadableKeywords::fixed(
                KeywordList::parse(auto),
                "auto-keywords",
            )),
        )
    }

    #[test]
    fn file_source_keeps_only_error_lines() {
        let monitor = file_monitor("");
        assert!(monitor.classify("INFO all good").is_none());
        assert!(monitor.classify("   ").is_none());
        assert_eq!(
            monitor.classify("  app: error: disk full \n"),
            Some(LogEvent {
                line: "app: error: disk full".to_string(),
                auto: false,
            })
        );
    }

    #[test]
    fn auto_keywords_mark_events() {
        let monitor = file_monitor("disk full\n");
        let event = monitor.classify("ERROR Disk Full on /var").unwrap();
        assert!(event.auto);
    }

    #[test]
    fn journal_source_forwards_everything_non_empty() {
        let monitor = LogMonitor::new(
            LogSource::Journal {
                levels: vec!["err".to_string(), "emerg".to_string()],
            },
            Arc::new(ReloadableKeywords::fixed(KeywordList::default(), "auto-keywords")),
        );
        assert!(monitor.classify("nginx[12]: upstream timed out").is_some());
    }

    #[tokio::test]
    async fn follow_forwards_qualifying_lines_in_order() {
        let monitor = file_monitor("OOM\n");
        let input: &[u8] = b"INFO boot\nERROR first\nFATAL OOM killer\n";
        let (tx, mut rx) = mpsc::channel(8);

        monitor.follow(input, &tx).await.unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.line, "ERROR first");
        assert!(!first.auto);
        let second = rx.recv().await.unwrap();
        assert!(second.auto);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_stop_following() {
        let monitor = file_monitor("");
        let input: &[u8] = b"ERROR first\nERROR bad \xff byte\nERROR third";
        let (tx, mut rx) = mpsc::channel(8);

        monitor.follow(input, &tx).await.unwrap();
        drop(tx);

        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            lines.push(event.line);
        }
        assert_eq!(
            lines,
            vec!["ERROR first", "ERROR bad \u{FFFD} byte", "ERROR third"]
        );
    }
}
