//! syncd - mailbox synchronization daemon
//!
//! Mirrors every active receiver into the local inbox database on two cron
//! schedules (incremental and daily full), and offers one-shot manual syncs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info};

use mailsync::sync::{CronTimer, Scheduler, SyncWorker};
use mailsync::{GmailMailboxClient, ReceiverDirectory, ReceiverId, SqliteInbox, SyncConfig, Tier};

#[derive(Parser)]
#[command(name = "syncd", version, about = "Mailbox synchronization daemon")]
struct Cli {
    /// Settings file (defaults to ~/.config/mailsync/mailsync.json)
    #[arg(long, global = true, env = "MAILSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run both sync tiers on their schedules until Ctrl-C
    Run,
    /// Sync one receiver now and print the outcome
    Trigger {
        tenant: String,
        receiver: String,
        #[arg(long, default_value = "incremental")]
        tier: Tier,
    },
    /// List active receivers
    Receivers,
    /// Write a settings file with the default values
    Init {
        /// Replace an existing settings file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Initialize config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Init { force } => write_default_settings(cli.config, force),
        Command::Run => {
            let (settings, inbox) = open(cli.config.as_deref())?;
            runtime()?.block_on(serve(&settings, inbox))
        }
        Command::Trigger {
            tenant,
            receiver,
            tier,
        } => {
            let (settings, inbox) = open(cli.config.as_deref())?;
            let receiver_id = ReceiverId::new(tenant, receiver);
            runtime()?.block_on(trigger(&settings, inbox, receiver_id, tier))
        }
        Command::Receivers => {
            let (_, inbox) = open(cli.config.as_deref())?;
            list_receivers(inbox.as_ref())
        }
    }
}

/// Load settings and open the inbox database
fn open(config_path: Option<&Path>) -> Result<(SyncConfig, Arc<SqliteInbox>)> {
    let settings = match config_path {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::load()?,
    };

    let db_path = settings
        .database_path()
        .context("No database path configured and no home directory found")?;
    info!("Using database at {:?}", db_path);
    let inbox = SqliteInbox::open(&db_path)?;
    Ok((settings, Arc::new(inbox)))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start Tokio runtime")
}

fn write_default_settings(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path
        .or_else(SyncConfig::default_settings_path)
        .context("Could not determine config directory")?;
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    SyncConfig::default().save(&path)?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}

fn build_scheduler(settings: &SyncConfig, inbox: Arc<SqliteInbox>) -> Arc<Scheduler> {
    let mut gmail = GmailMailboxClient::new()
        .with_request_timeout(settings.request_timeout())
        .with_max_retries(settings.gmail_max_retries);
    if let Some(limit) = settings.full_fetch_limit {
        gmail = gmail.with_max_full_messages(limit);
    }
    let worker = SyncWorker::new(Arc::new(gmail), inbox.clone(), settings.receiver_timeout());
    Arc::new(Scheduler::new(inbox, worker).with_history_size(settings.history_size))
}

async fn serve(settings: &SyncConfig, inbox: Arc<SqliteInbox>) -> Result<()> {
    let incremental = CronTimer::new(settings.schedule(Tier::Incremental)?);
    let full = CronTimer::new(settings.schedule(Tier::Full)?);

    let scheduler = build_scheduler(settings, inbox);
    let handle = scheduler.start(Box::new(incremental), Box::new(full));
    info!(
        "syncd started: incremental '{}', full '{}', receiver timeout {}s",
        settings.incremental_cron, settings.full_cron, settings.receiver_timeout_secs
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn trigger(
    settings: &SyncConfig,
    inbox: Arc<SqliteInbox>,
    receiver_id: ReceiverId,
    tier: Tier,
) -> Result<()> {
    let scheduler = build_scheduler(settings, inbox);
    let outcome = scheduler.trigger_custom_sync(&receiver_id, tier).await?;

    match &outcome.result {
        Ok(report) => {
            println!(
                "{} {} sync: fetched {}, inserted {}, skipped {}{}",
                receiver_id,
                tier,
                report.messages_fetched,
                report.messages_inserted,
                report.messages_skipped,
                if report.fell_back_to_full { " (fell back to full)" } else { "" }
            );
            if let Some(cursor) = report.cursor_advanced_to {
                println!("cursor advanced to {}", cursor);
            }
            Ok(())
        }
        Err(e) => bail!("{} {} sync failed: {}", receiver_id, tier, e),
    }
}

fn list_receivers(directory: &dyn ReceiverDirectory) -> Result<()> {
    let receivers = directory.list_active()?;
    if receivers.is_empty() {
        println!("No active receivers");
        return Ok(());
    }

    for receiver in receivers {
        let cursor = receiver
            .cursor
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        let last_full = receiver
            .last_full_sync_at
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
        println!(
            "{}\t{}\t{}\tcursor={}\tlast_full={}",
            receiver.id,
            receiver.display_name.as_deref().unwrap_or("-"),
            receiver.connection.provider(),
            cursor,
            last_full
        );
    }
    Ok(())
}
