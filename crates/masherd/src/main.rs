//! masherd: long-running masher.
//!
//! On startup it resumes every push a previous process left unfinished, then
//! reads trigger events as JSON lines on stdin (one object per line, the
//! shape of [`TriggerEvent`]) and runs each trigger concurrently.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use masher_core::metrics::METRICS;
use masher_core::{init_tracing, Masher, MasherConfig, PushReport, TriggerEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "masherd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run triggered pushes and resume interrupted ones", long_about = None)]
struct Args {
    /// Configuration file (default: $MASHER_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json_logs: bool,

    /// Only resume incomplete pushes, then exit
    #[arg(long)]
    resume_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs, Level::INFO);

    let config = MasherConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let masher = Arc::new(
        Masher::from_config(&config)
            .await
            .context("Failed to initialise the masher")?,
    );
    info!(version = masher_core::VERSION, "masherd started");

    let resumed = masher
        .resume_incomplete()
        .await
        .context("Failed to resume incomplete pushes")?;
    info!(count = resumed.len(), "startup recovery finished");

    if !args.resume_only {
        serve(masher).await?;
    }

    METRICS.flush();
    Ok(())
}

/// Run triggers from stdin until EOF, then wait for the ones in flight.
async fn serve(masher: Arc<Masher>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running = JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        let Some(event) = parse_trigger(&line) else {
            continue;
        };
        let masher = Arc::clone(&masher);
        running.spawn(async move {
            match masher.handle_trigger(&event).await {
                Ok(reports) => log_reports(&reports),
                Err(e) => warn!(sender = %event.sender, error = %e, "trigger refused"),
            }
        });
    }

    info!(in_flight = running.len(), "input closed, waiting for pushes");
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "trigger task panicked");
        }
    }
    Ok(())
}

fn parse_trigger(line: &str) -> Option<TriggerEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "ignoring malformed trigger");
            None
        }
    }
}

fn log_reports(reports: &[PushReport]) {
    for report in reports {
        match report {
            PushReport::Accepted(push) => info!(
                push_id = %push.push_id,
                repo = %push.repo,
                outcome = ?push.outcome,
                caveats = push.caveats.len(),
                "push finished"
            ),
            PushReport::Rejected { repo, reason } => {
                warn!(repo = %repo, reason = %reason, "push rejected")
            }
            PushReport::Errored { repo, error } => {
                error!(repo = %repo, error = %error, "push errored")
            }
        }
    }
}
