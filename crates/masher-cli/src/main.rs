//! Masher - release-push orchestrator CLI
//!
//! The `masher` command lets release engineers trigger pushes and inspect or
//! steer the ones in flight.
//!
//! ## Commands
//!
//! - `trigger`: Push every approved update for a request type
//! - `resume`: Continue an interrupted push (or all of them)
//! - `show` / `list`: Inspect push records and their phase history
//! - `locks` / `unlock`: Inspect and override repository locks
//! - `cancel`: Stop a push at its next phase boundary
//! - `prune`: Delete old composes of a repository

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use masher_core::{
    init_tracing, Masher, MasherConfig, PushFilter, PushId, PushOutcome, PushRecord, PushReport,
    RepoKey, RequestType, TriggerEvent,
};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "masher")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish approved package updates into their repositories", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (default: $MASHER_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push every approved update for a request type
    Trigger {
        /// Release-engineering identity sending the trigger
        #[arg(long, env = "MASHER_SENDER")]
        sender: String,

        /// `testing` or `stable`
        #[arg(long)]
        request: RequestType,

        /// Limit to these releases (repeatable; default: all)
        #[arg(long = "release")]
        releases: Vec<String>,

        /// Hex HMAC-SHA256 signature of the trigger
        #[arg(long)]
        signature: Option<String>,
    },

    /// Resume one push, or every push that is not finished
    Resume {
        /// Push to resume (default: all incomplete pushes)
        push_id: Option<String>,
    },

    /// Show a push with its phase history and caveats
    Show {
        push_id: String,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List pushes
    List {
        /// Only pushes that have not finished
        #[arg(long)]
        active: bool,

        /// Limit to one repository (e.g. f17-updates-testing)
        #[arg(long)]
        repo: Option<RepoKey>,

        #[arg(long)]
        json: bool,
    },

    /// Show held repository locks
    Locks,

    /// Forcibly release a repository lock
    Unlock {
        /// Repository, e.g. f17-updates
        repo: RepoKey,

        /// Who is overriding the lock (recorded on the push)
        #[arg(long)]
        operator: String,
    },

    /// Ask a push to stop before it publishes
    Cancel { push_id: String },

    /// Delete old composes of a repository
    Prune {
        repo: RepoKey,

        /// Number of most recent composes to keep
        #[arg(long, default_value = "3")]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json_logs, level);

    let config = MasherConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let masher = Masher::from_config(&config)
        .await
        .context("Failed to initialise the masher")?;

    match cli.command {
        Commands::Trigger {
            sender,
            request,
            releases,
            signature,
        } => {
            let mut event = TriggerEvent::new(sender, request).with_releases(releases);
            event.signature = signature;
            cmd_trigger(&masher, &event).await
        }
        Commands::Resume { push_id } => cmd_resume(&masher, push_id).await,
        Commands::Show { push_id, json } => cmd_show(&masher, &push_id, json).await,
        Commands::List { active, repo, json } => {
            let filter = PushFilter {
                repo,
                active_only: active,
            };
            cmd_list(&masher, &filter, json).await
        }
        Commands::Locks => cmd_locks(&masher).await,
        Commands::Unlock { repo, operator } => cmd_unlock(&masher, &repo, &operator).await,
        Commands::Cancel { push_id } => cmd_cancel(&masher, &push_id).await,
        Commands::Prune { repo, keep } => cmd_prune(&masher, &repo, keep).await,
    }
}

fn outcome(push: &PushRecord) -> String {
    match &push.outcome {
        PushOutcome::InProgress => format!("in progress (last phase: {})", push.phase),
        PushOutcome::Completed => "completed".to_string(),
        PushOutcome::Failed { phase, reason } => format!("failed at {phase}: {reason}"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_trigger(masher: &Masher, event: &TriggerEvent) -> Result<()> {
    let reports = masher
        .handle_trigger(event)
        .await
        .context("Trigger was not accepted")?;
    if reports.is_empty() {
        println!("Nothing to push.");
        return Ok(());
    }

    let mut failed = 0;
    for report in &reports {
        match report {
            PushReport::Accepted(push) => {
                println!("{}  {:<24} {}", push.push_id.short(), push.repo, outcome(push));
                for caveat in &push.caveats {
                    println!("    caveat: {}", caveat.message);
                }
                if matches!(push.outcome, PushOutcome::Failed { .. }) {
                    failed += 1;
                }
            }
            PushReport::Rejected { repo, reason } => {
                println!("--------  {repo:<24} rejected: {reason}");
                failed += 1;
            }
            PushReport::Errored { repo, error } => {
                println!("--------  {repo:<24} error: {error}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} push(es) did not complete", reports.len());
    }
    Ok(())
}

async fn cmd_resume(masher: &Masher, push_id: Option<String>) -> Result<()> {
    let pushes = match push_id {
        Some(id) => vec![masher
            .resume(&PushId(id))
            .await
            .context("Failed to resume push")?],
        None => masher
            .resume_incomplete()
            .await
            .context("Failed to resume incomplete pushes")?,
    };
    info!(count = pushes.len(), "resume finished");
    for push in &pushes {
        println!("{}  {:<24} {}", push.push_id.short(), push.repo, outcome(push));
    }
    Ok(())
}

async fn cmd_show(masher: &Masher, push_id: &str, json: bool) -> Result<()> {
    let push = masher
        .show(&PushId(push_id.to_string()))
        .await
        .with_context(|| format!("Push {push_id} not found"))?;
    if json {
        return print_json(&push);
    }

    println!("Push:     {}", push.push_id);
    println!("Repo:     {}", push.repo);
    println!("Outcome:  {}", outcome(&push));
    println!("Created:  {}", push.created_at.to_rfc3339());
    if let Some(done) = push.completed_at {
        println!("Finished: {}", done.to_rfc3339());
    }
    if push.cancel_requested {
        println!("Cancellation requested");
    }

    println!("\nUpdates:");
    for update in &push.updates {
        let builds: Vec<String> = update.nvrs().map(ToString::to_string).collect();
        println!("  {:<24} {}", update.id, builds.join(" "));
    }

    println!("\nPhases:");
    for record in &push.phase_records {
        println!(
            "  {:<18} {:?} {:?} attempts={} {}",
            record.phase.as_str(),
            record.kind,
            record.outcome,
            record.attempts,
            record.finished_at.format("%Y-%m-%d %H:%M:%S"),
        );
        for (key, value) in &record.artifacts {
            println!("      {key} = {value}");
        }
    }

    if !push.caveats.is_empty() {
        println!("\nCaveats:");
        for caveat in &push.caveats {
            println!("  [{:?}] {}", caveat.kind, caveat.message);
        }
    }
    Ok(())
}

async fn cmd_list(masher: &Masher, filter: &PushFilter, json: bool) -> Result<()> {
    let pushes = masher.list(filter).await.context("Failed to list pushes")?;
    if json {
        return print_json(&pushes);
    }
    if pushes.is_empty() {
        println!("No pushes.");
        return Ok(());
    }
    for push in &pushes {
        println!(
            "{}  {}  {:<24} {:>3} update(s)  {}",
            push.push_id.short(),
            push.created_at.format("%Y-%m-%d %H:%M"),
            push.repo,
            push.updates.len(),
            outcome(push)
        );
    }
    Ok(())
}

async fn cmd_locks(masher: &Masher) -> Result<()> {
    let locks = masher.locks().await.context("Failed to read locks")?;
    if locks.is_empty() {
        println!("No repositories are locked.");
    }
    for lock in &locks {
        println!(
            "{:<24} held by {} since {}",
            lock.repo,
            lock.push_id,
            lock.acquired_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_unlock(masher: &Masher, repo: &RepoKey, operator: &str) -> Result<()> {
    match masher
        .unlock(repo, operator)
        .await
        .context("Failed to release lock")?
    {
        None => println!("{repo} was not locked."),
        Some(forced) => {
            println!("Released {repo} (held by {}).", forced.lock.push_id);
            if let Some(push) = forced.push {
                println!("Push {} is now {}.", push.push_id.short(), outcome(&push));
            }
        }
    }
    Ok(())
}

async fn cmd_cancel(masher: &Masher, push_id: &str) -> Result<()> {
    let id = PushId(push_id.to_string());
    if masher.cancel(&id).await.context("Failed to request cancellation")? {
        println!("Cancellation requested for {push_id}; it stops before publishing.");
    } else {
        println!("Push {push_id} has already finished.");
    }
    Ok(())
}

async fn cmd_prune(masher: &Masher, repo: &RepoKey, keep: usize) -> Result<()> {
    let removed = masher
        .prune(repo, keep)
        .await
        .with_context(|| format!("Failed to prune composes of {repo}"))?;
    for path in &removed {
        println!("removed {}", path.display());
    }
    println!("{} compose(s) removed.", removed.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn trigger_parses_releases_and_request() {
        let cli = Cli::try_parse_from([
            "masher",
            "trigger",
            "--sender",
            "releng",
            "--request",
            "stable",
            "--release",
            "F17",
            "--release",
            "F18",
        ])
        .unwrap();
        match cli.command {
            Commands::Trigger {
                request, releases, ..
            } => {
                assert_eq!(request, RequestType::Stable);
                assert_eq!(releases, vec!["F17", "F18"]);
            }
            _ => panic!("expected trigger"),
        }
    }

    #[test]
    fn unlock_requires_operator() {
        assert!(Cli::try_parse_from(["masher", "unlock", "f17-updates"]).is_err());
        let cli =
            Cli::try_parse_from(["masher", "unlock", "f17-updates", "--operator", "ops"]).unwrap();
        match cli.command {
            Commands::Unlock { repo, operator } => {
                assert_eq!(repo, RepoKey::new("F17", RequestType::Stable));
                assert_eq!(operator, "ops");
            }
            _ => panic!("expected unlock"),
        }
    }
}
