mod assignments;
mod config;
mod daemon;
mod platform;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use leadline_core::config::Config;
use leadline_core::{MutationKind, MutationQueue, MutationStatus, Payload, SubmitOutcome};

use crate::config::{expand_path, load_state, load_syncd_config};
use crate::daemon::Services;

#[derive(Parser)]
#[command(name = "leadline-syncd", about = "Background sync daemon for leadline")]
struct Args {
    /// Path to configuration file (defaults to ~/.config/leadline/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default)
    Run,
    /// Show the local queue
    Status,
    /// Drain the queue once
    Drain,
    /// Put a failed mutation back in the queue
    Retry { id: String },
    /// Drop a queued or failed mutation
    Discard { id: String },
    /// Submit a write, queueing it when offline
    Submit {
        /// One of create_lead, update_lead, add_note, log_call, mark_attendance, complete_reminder
        kind: String,
        /// JSON object with the mutation fields
        payload: String,
    },
    /// Poll reminders once and notify about due tasks
    Reminders,
    /// Register this device's push subscription
    Subscribe,
    /// Remove this device's push subscription
    Unsubscribe,
    /// Print the JSON schema of the configuration file
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let command = args.command.unwrap_or(Command::Run);
    if let Command::Schema = command {
        println!("{}", Config::generate_schema()?);
        return Ok(());
    }

    let config_path = args.config.as_deref().map(expand_path).transpose()?;
    let config = load_syncd_config(config_path.as_deref())?;

    if let Command::Status = command {
        return print_status(&config);
    }

    let (state, state_path) = load_state()?;
    let services = Services::build(config, state, state_path).await?;

    match command {
        Command::Run => daemon::run(services).await?,
        Command::Drain => {
            if !services.monitor.is_online() {
                println!("{}", "Offline, nothing drained".yellow());
                return Ok(());
            }
            let report = services.engine.drain().await?;
            if report.is_noop() {
                println!("Queue is empty");
            } else {
                println!(
                    "{} synced, {} retrying, {} failed, {} deferred",
                    report.synced.to_string().green(),
                    report.retried.to_string().yellow(),
                    report.failed.to_string().red(),
                    report.deferred
                );
            }
        }
        Command::Retry { id } => {
            if services.engine.retry_failed(&id)? {
                println!("{} {id} queued for another attempt", "Retrying".green());
            } else {
                bail!("No failed mutation with id {id}");
            }
        }
        Command::Discard { id } => {
            if services.engine.discard(&id)? {
                println!("{} {id}", "Discarded".yellow());
            } else {
                bail!("No queued mutation with id {id}");
            }
        }
        Command::Submit { kind, payload } => {
            let kind = MutationKind::parse(&kind).with_context(|| format!("Unknown kind {kind}"))?;
            let payload: Payload =
                serde_json::from_str(&payload).context("Payload must be a JSON object")?;
            match services.engine.submit(kind, payload).await? {
                SubmitOutcome::Remote(row) => {
                    println!("{}", "Saved".green());
                    println!("{}", serde_json::to_string_pretty(&row)?);
                }
                SubmitOutcome::Queued { local_id } => {
                    println!("{} as {local_id}, will sync when online", "Queued".yellow());
                }
            }
        }
        Command::Reminders => {
            let shown = services.scheduler.tick().await?;
            println!("{shown} reminder notification(s) shown");
        }
        Command::Subscribe => {
            let permission = services.dispatcher.request_permission().await;
            println!("Notification permission: {permission}");
            let subscription = services.dispatcher.subscribe().await?;
            println!("{} {}", "Subscribed".green(), subscription.endpoint);
        }
        Command::Unsubscribe => {
            if services.dispatcher.unsubscribe().await? {
                println!("{}", "Unsubscribed".green());
            } else {
                println!("No push subscription to remove");
            }
        }
        Command::Status | Command::Schema => {}
    }

    Ok(())
}

fn print_status(config: &Config) -> Result<()> {
    let database_path = config.database_path()?;
    if !database_path.exists() {
        println!("No local queue at {}", database_path.display());
        return Ok(());
    }
    let queue = MutationQueue::open(&database_path)?;

    let pending = queue.count(Some(MutationStatus::Pending))?;
    let syncing = queue.count(Some(MutationStatus::Syncing))?;
    let failed = queue.count(Some(MutationStatus::Failed))?;
    println!(
        "{} pending, {} syncing, {} failed",
        pending.to_string().yellow(),
        syncing,
        failed.to_string().red()
    );

    for mutation in queue.list(None)? {
        let status = match mutation.status {
            MutationStatus::Failed => mutation.status.to_string().red(),
            MutationStatus::Syncing => mutation.status.to_string().cyan(),
            _ => mutation.status.to_string().yellow(),
        };
        print!(
            "  {} {:<18} {:<8} attempts={}",
            mutation.id.dimmed(),
            mutation.kind.as_str(),
            status,
            mutation.attempts
        );
        if let Some(error) = &mutation.last_error {
            print!("  {}", error.dimmed());
        }
        println!();
    }
    Ok(())
}
