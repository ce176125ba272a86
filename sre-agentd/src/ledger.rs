// ABOUTME: stores one record per detected incident as append-only json lines.
// ABOUTME: executions are appended as separate events and folded back into records on query.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sre_agent_common::{ExecutionOutcome, IncidentRecord, IncidentStats, NewIncident};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

#[async_trait]
pub trait IncidentLedger: Send + Sync {
    /// Records an incident before anything runs. Returns its identifier.
    async fn append(&self, incident: NewIncident) -> anyhow::Result<u64>;

    async fn record_execution(
        &self,
        id: u64,
        outcome: &ExecutionOutcome,
        executed: bool,
    ) -> anyhow::Result<()>;

    /// Most recent first.
    async fn recent(&self, limit: usize) -> anyhow::Result<Vec<IncidentRecord>>;

    async fn statistics(&self, days: u32) -> anyhow::Result<IncidentStats>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LedgerEvent {
    Opened {
        record: IncidentRecord,
    },
    Executed {
        id: u64,
        ts: DateTime<Utc>,
        executed: bool,
        outcome: ExecutionOutcome,
    },
}

pub struct JsonlLedger {
    path: PathBuf,
    // Serializes writers and remembers the next id.
    next_id: Mutex<u64>,
}

impl JsonlLedger {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create ledger directory {}", parent.display()))?;
            }
        }

        terminate_torn_tail(&path).await?;
        let records = read_records(&path).await?;
        let next_id = records.keys().next_back().map_or(1, |id| id + 1);
        tracing::info!(path = %path.display(), incidents = records.len(), "incident ledger opened");

        Ok(Self {
            path,
            next_id: Mutex::new(next_id),
        })
    }

    async fn write_event(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open incident ledger at {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl IncidentLedger for JsonlLedger {
    async fn append(&self, incident: NewIncident) -> anyhow::Result<u64> {
        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        let record = IncidentRecord::open(id, Utc::now(), incident);
        self.write_event(&LedgerEvent::Opened { record }).await?;
        *next_id += 1;
        Ok(id)
    }

    async fn record_execution(
        &self,
        id: u64,
        outcome: &ExecutionOutcome,
        executed: bool,
    ) -> anyhow::Result<()> {
        let next_id = self.next_id.lock().await;
        if id == 0 || id >= *next_id {
            anyhow::bail!("unknown incident id {id}");
        }
        self.write_event(&LedgerEvent::Executed {
            id,
            ts: Utc::now(),
            executed,
            outcome: outcome.clone(),
        })
        .await
    }

    async fn recent(&self, limit: usize) -> anyhow::Result<Vec<IncidentRecord>> {
        let records = read_records(&self.path).await?;
        Ok(records.into_values().rev().take(limit).collect())
    }

    async fn statistics(&self, days: u32) -> anyhow::Result<IncidentStats> {
        let records = read_records(&self.path).await?;
        let since = Utc::now() - Duration::days(i64::from(days));
        Ok(IncidentStats::from_records(records.values(), since, days))
    }
}

/// Ends a partial final line left by an interrupted write, so the next event starts on a
/// line of its own.
async fn terminate_torn_tail(path: &Path) -> anyhow::Result<()> {
    let mut file = match tokio::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("open incident ledger at {}", path.display()))
        }
    };

    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(std::io::SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] != b'\n' {
        tracing::warn!(path = %path.display(), "incident ledger ends in a partial line; sealing it");
        file.write_all(b"\n").await?;
        file.flush().await?;
    }
    Ok(())
}

async fn read_records(path: &Path) -> anyhow::Result<BTreeMap<u64, IncidentRecord>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("read incident ledger at {}", path.display()))
        }
    };

    let mut records = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: LedgerEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                // A torn final write must not hide every other incident.
                tracing::warn!(line = lineno + 1, error = %err, "skipping unreadable ledger line");
                continue;
            }
        };
        match event {
            LedgerEvent::Opened { record } => {
                records.insert(record.id, record);
            }
            LedgerEvent::Executed {
                id,
                ts,
                executed,
                outcome,
            } => {
                if let Some(record) = records.get_mut(&id) {
                    record.executed = executed;
                    record.outcome = Some(outcome);
                    record.execution_timestamp = Some(ts);
                }
            }
        }
    }
    Ok(records)
}
