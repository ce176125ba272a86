// ABOUTME: provides the operator cli for approving, ignoring, and querying incidents on the local daemon.
// ABOUTME: prints the daemon's json responses as returned, or local verdicts for offline checks.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sre_agent_common::{
    Action, ApproveAction, CheckAction, IgnoreAction, IncidentsAction, PromptAction, StatsAction,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use srectl::{build_request, local_verdict, parse_and_validate, validate_verdict};

#[derive(Debug, Parser)]
#[command(name = "srectl")]
struct Args {
    #[arg(long, env = "SRE_AGENT_SOCKET", default_value = "/tmp/sre-agentd.sock", global = true)]
    socket_path: PathBuf,

    #[arg(long, global = true)]
    request_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Ping,
    /// Run a command on the daemon host. The daemon re-checks it before running.
    Approve {
        command: String,

        #[arg(long)]
        incident_id: Option<u64>,
    },
    Ignore {
        #[arg(long)]
        incident_id: Option<u64>,
    },
    Check {
        command: String,

        /// Evaluate here instead of asking the daemon.
        #[arg(long)]
        local: bool,

        #[arg(long, requires = "local")]
        deny_list: Option<PathBuf>,
    },
    Reload,
    Incidents {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Show the proposer's system prompt, or replace it with `--set`.
    Prompt {
        #[arg(long)]
        set: Option<String>,
    },
    /// Send a raw request document.
    Send {
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        json: Option<String>,
    },
    Validate {
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        json: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let request_id = args.request_id.as_deref();

    let action = match args.command {
        Command::Ping => Action::Ping,
        Command::Approve {
            command,
            incident_id,
        } => Action::Approve(ApproveAction {
            command,
            incident_id,
        }),
        Command::Ignore { incident_id } => Action::Ignore(IgnoreAction { incident_id }),
        Command::Check {
            command,
            local: true,
            deny_list,
        } => {
            let verdict = local_verdict(&command, deny_list.as_deref());
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            return Ok(());
        }
        Command::Check { command, .. } => Action::Check(CheckAction { command }),
        Command::Reload => Action::Reload,
        Command::Incidents { limit } => Action::Incidents(IncidentsAction { limit }),
        Command::Stats { days } => Action::Stats(StatsAction { days }),
        Command::Prompt { set } => Action::Prompt(PromptAction { text: set }),
        Command::Send { file, json } => {
            let input = read_input(file.as_deref(), json.as_deref()).await?;
            let request = parse_and_validate(&input, request_id)?;
            let response = send(&args.socket_path, &serde_json::to_string(&request)?).await?;
            print!("{response}");
            return Ok(());
        }
        Command::Validate { file, json } => {
            let input = read_input(file.as_deref(), json.as_deref()).await?;
            let verdict = validate_verdict(&input);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            return Ok(());
        }
    };

    let request = build_request(request_id, action)?;
    let response = send(&args.socket_path, &serde_json::to_string(&request)?).await?;
    print!("{response}");
    Ok(())
}

async fn read_input(file: Option<&str>, json: Option<&str>) -> anyhow::Result<String> {
    if let Some(json) = json {
        return Ok(json.to_string());
    }

    if let Some(file) = file {
        return Ok(tokio::fs::read_to_string(file).await?);
    }

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    Ok(input)
}

async fn send(socket_path: &std::path::Path, input: &str) -> anyhow::Result<String> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(input.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}
