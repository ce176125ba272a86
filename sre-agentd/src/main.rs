// ABOUTME: runs the remediation daemon: follows logs, proposes and gates fixes, serves approvals.
// ABOUTME: wires configuration into the monitor, remediator, and local control socket.

mod audit;
mod config;
mod ledger;
mod monitor;
mod notifier;
mod orchestrator;
mod proposer;
mod runner;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sre_agent_common::{PolicyEngine, ReloadableKeywords};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{Config, LogRotation, LoggingConfig};
use crate::ledger::{IncidentLedger, JsonlLedger};
use crate::monitor::{LogMonitor, LogSource};
use crate::notifier::{LogNotifier, Notifier, SlackNotifier};
use crate::orchestrator::Remediator;
use crate::proposer::{CommandProposer, GeminiProposer};
use crate::runner::CommandRunner;
use crate::server::ServerContext;

const EVENT_QUEUE_DEPTH: usize = 256;
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "sre-agentd", version, about = "Log-driven remediation agent with a command safety gate")]
struct Args {
    #[arg(long, env = "SRE_AGENT_CONFIG", default_value = "config/agent.toml")]
    config: PathBuf,

    /// Overrides `service.socket_path` from the config file.
    #[arg(long)]
    socket_path: Option<PathBuf>,
}

/// Installs the global subscriber. The returned guard flushes the file writer on drop and
/// must live as long as the process.
fn setup_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stdout_layer = if config.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(config, path)?);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            let layer = if config.json {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

fn rolling_appender(
    config: &LoggingConfig,
    path: &std::path::Path,
) -> anyhow::Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => std::path::Path::new("."),
    };
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("logging.file has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;

    let rotation = match config.rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };
    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .max_log_files(config.max_files)
        .build(dir)
        .with_context(|| format!("open log file {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("load config from {}", args.config.display()))?;
    let _log_guard = setup_logging(&config.logging)?;

    let socket_path = args
        .socket_path
        .unwrap_or_else(|| config.service.socket_path.clone());

    let policy = Arc::new(PolicyEngine::new(ReloadableKeywords::open(
        config.security.deny_list_file.clone(),
        "deny-list",
    )));
    let auto_keywords = Arc::new(ReloadableKeywords::open(
        config.security.auto_keywords_file.clone(),
        "auto-keywords",
    ));
    let command_timeout = config.security.command_timeout();
    let runner = Arc::new(CommandRunner::new(command_timeout));
    let ledger: Arc<dyn IncidentLedger> =
        Arc::new(JsonlLedger::open(config.ledger.path.clone()).await?);
    let proposer: Arc<dyn CommandProposer> = Arc::new(GeminiProposer::new(
        &config.llm,
        config.security.prompt_file.clone(),
    )?);
    let notifier: Arc<dyn Notifier> = match &config.slack {
        Some(slack) => Arc::new(SlackNotifier::new(slack)?),
        None => {
            tracing::warn!("no [slack] section configured; notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    if let Some(parent) = config.audit.path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create audit directory {}", parent.display()))?;
    }

    tracing::info!(
        deny_keywords = policy.deny_keyword_count(),
        rules = ?policy.rule_names(),
        timeout_secs = runner.timeout().as_secs(),
        "policy loaded"
    );

    let remediator = Arc::new(Remediator::new(
        Arc::clone(&policy),
        runner,
        ledger,
        proposer,
        notifier,
    ));

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let monitor = LogMonitor::new(
        LogSource::from_config(&config.monitoring)?,
        Arc::clone(&auto_keywords),
    );
    let monitor_task = tokio::spawn(async move {
        if let Err(err) = monitor.run(tx).await {
            tracing::error!(error = %err, "log monitor failed");
        }
    });
    let mut remediator_task = tokio::spawn(
        Arc::clone(&remediator).run(rx, config.monitoring.max_concurrent_events),
    );

    let ctx = Arc::new(ServerContext {
        remediator,
        auto_keywords,
        audit_path: config.audit.path.clone(),
        prompt_file: config.security.prompt_file.clone(),
    });

    let result = tokio::select! {
        res = server::run(&socket_path, ctx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; shutting down");
            Ok(())
        }
    };

    // Dropping the monitor closes the event channel, so the remediator finishes what it holds.
    monitor_task.abort();
    if tokio::time::timeout(command_timeout + DRAIN_GRACE, &mut remediator_task)
        .await
        .is_err()
    {
        tracing::warn!("in-flight remediations did not finish; abandoning them");
        remediator_task.abort();
    }
    result
}
