#![forbid(unsafe_code)]

mod bin_detect;
mod config;
mod defaults;
mod executors;
mod ingest;
mod issues;
mod logging;
mod orchestrator;
mod prompt;
mod screen;
mod worker;

use clap::{Parser, Subcommand};
use config::{ConfigArgs, RunnerConfig};
use issues::OutboxIssueService;
use orchestrator::{Orchestrator, OrchestratorConfig};
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use triage_storage::SqliteStore;
use worker::Worker;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// triage_runner: deduplicate incident payloads and have a read-only code agent
/// analyse each one against the local checkout.
#[derive(Parser, Debug)]
#[command(name = "triage_runner")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TRIAGE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drain the queue, then keep polling
    Run {
        /// Exit once the queue is empty
        #[arg(long)]
        once: bool,
    },

    /// Enqueue one JSON payload and print the acknowledgement
    Ingest {
        /// Payload file, or `-` / omitted for stdin
        input: Option<PathBuf>,
    },

    /// Print queue counts, recent jobs and an hourly histogram as JSON
    Status {
        #[arg(long, default_value_t = 20)]
        recent: usize,

        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Delete finished jobs older than the given age
    Purge {
        #[arg(long)]
        older_than_days: u64,
    },
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}

fn read_input(input: Option<&PathBuf>) -> std::io::Result<String> {
    match input {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path),
        _ => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            Ok(body)
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_json);

    let cfg = RunnerConfig::load(&cli.config).unwrap_or_else(|err| {
        tracing::error!(error = %err, "configuration rejected");
        std::process::exit(2);
    });
    let mut store = SqliteStore::open(&cfg.storage_dir)?;

    match cli.command {
        Commands::Run { once } => {
            if cfg.agent_bin.is_none() {
                tracing::warn!(
                    "agent binary not found; jobs will fail until --claude-bin or TRIAGE_CLAUDE_BIN is set"
                );
            }
            tracing::info!(
                repo_root = %cfg.repo_root.display(),
                storage_dir = %cfg.storage_dir.display(),
                log_dir = %cfg.log_dir.display(),
                routes = cfg.routing.destinations().count(),
                "runner configured"
            );
            let orchestrator =
                Orchestrator::new(OrchestratorConfig::from_runner(&cfg), &cfg.routing);
            let issues = OutboxIssueService::new(&cfg.outbox_dir, &cfg.routing);
            let mut worker =
                Worker::new(&mut store, orchestrator, issues, cfg.dedup_window_ms());
            if once {
                let processed = worker.run_until_idle()?;
                tracing::info!(processed, "queue empty, exiting");
            } else {
                worker.run_forever(cfg.poll);
            }
        }
        Commands::Ingest { input } => {
            let body = read_input(input.as_ref())?;
            let ack = ingest::ingest_text(&mut store, &body, cfg.dedup_window_ms())?;
            println!("{}", serde_json::to_string(&ack)?);
        }
        Commands::Status { recent, hours } => {
            let report = json!({
                "counts": store.status_counts()?,
                "recent": store.recent_jobs(recent)?,
                "hourly": store.hourly_histogram(hours)?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Purge { older_than_days } => {
            let age_ms = i64::try_from(older_than_days)
                .unwrap_or(i64::MAX)
                .saturating_mul(DAY_MS);
            let removed = store.purge_older_than(now_ms().saturating_sub(age_ms))?;
            tracing::info!(removed, older_than_days, "purged finished jobs");
            println!("{}", json!({ "removed": removed }));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests;
