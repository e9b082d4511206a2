//! # mailsyncd
//!
//! Background mailbox sync service.
//!
//! ## Commands
//!
//! - `run`: Start the scheduler until Ctrl-C or SIGTERM (default)
//! - `add-account`: Register an account or refresh its credential
//! - `accounts`: List accounts and their sync state
//! - `reinstate`: Clear a suspension after re-authentication
//! - `history`: Show recent runs of an account
//!
//! ## Example
//!
//! ```bash
//! mailsyncd add-account alice@example.com keychain:alice
//! mailsyncd run
//! mailsyncd history alice@example.com --limit 5
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use mailsync::{
    Account, AccountId, LogEventSink, Scheduler, SpoolFetchClient, SqliteSyncStore, Supervisor,
    SyncConfig, SyncEngine, SyncStore, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Background mailbox sync service
#[derive(Parser, Debug)]
#[command(name = "mailsyncd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: mailsync.json in the config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overriding the configured path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Do a single tick, wait for its runs and exit
        #[arg(long)]
        once: bool,
    },

    /// Register an account or refresh its credential
    AddAccount {
        /// Account id (usually the mailbox address)
        id: String,
        /// Opaque credential reference
        credential_ref: String,
    },

    /// List accounts
    Accounts,

    /// Clear an account's suspension
    Reinstate { id: String },

    /// Show recent runs of an account
    History {
        id: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load_file(path)?,
        None => SyncConfig::load()?,
    };
    if let Some(database) = &cli.database {
        config.database_path = Some(database.clone());
    }
    Ok(config)
}

fn open_store(config: &SyncConfig) -> Result<Arc<SqliteSyncStore>> {
    let path = config.resolved_database_path();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    info!("Using database {}", path.display());
    Ok(Arc::new(SqliteSyncStore::new(&path)?))
}

fn build_supervisor(config: SyncConfig, store: Arc<SqliteSyncStore>) -> Supervisor {
    let spool = config.resolved_spool_dir();
    info!("Reading pages from {}", spool.display());

    let engine = SyncEngine::new(
        store,
        Arc::new(SpoolFetchClient::new(spool)),
        Arc::new(LogEventSink),
        Arc::new(SystemClock),
        &config,
    );
    Supervisor::new(Scheduler::new(Arc::new(engine), config))
}

/// Ctrl-C, plus SIGTERM on Unix
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Install the handlers; signals arriving afterwards are not lost
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to listen for SIGTERM")?,
        })
    }

    /// Wait for the first shutdown signal and return its name
    #[cfg(unix)]
    async fn recv(&mut self) -> Result<&'static str> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                Ok("SIGINT")
            }
            _ = self.terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> Result<&'static str> {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        Ok("Ctrl-C")
    }
}

async fn run(config: SyncConfig, store: Arc<SqliteSyncStore>, once: bool) -> Result<()> {
    let run_timeout = config.run_timeout().to_std().unwrap_or_default();
    let supervisor = Arc::new(build_supervisor(config, store));

    if once {
        let scheduler = supervisor.scheduler().clone();
        let report = tokio::task::spawn_blocking(move || {
            let report = scheduler.tick();
            scheduler.wait_idle(run_timeout);
            report
        })
        .await?;
        info!(
            "Dispatched {} of {} eligible accounts",
            report.dispatched.len(),
            report.eligible.len()
        );
    } else {
        let mut shutdown = ShutdownSignal::install()?;
        supervisor.start()?;
        let signal = shutdown.recv().await?;
        info!("{} received, shutting down", signal);

        let stopping = supervisor.clone();
        let report = tokio::task::spawn_blocking(move || stopping.stop()).await?;
        if !report.drain.abandoned.is_empty() {
            error!(
                "Abandoned runs for: {}",
                report
                    .drain
                    .abandoned
                    .iter()
                    .map(AccountId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    println!("{}", serde_json::to_string_pretty(&supervisor.status())?);
    Ok(())
}

fn list_accounts(store: &dyn SyncStore) -> Result<()> {
    let accounts = store.list_accounts()?;
    if accounts.is_empty() {
        println!("No accounts registered");
        return Ok(());
    }

    for account in accounts {
        let last_sync = account
            .last_sync_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let state = match &account.suspension_reason {
            Some(reason) => format!("suspended ({})", reason),
            None if account.is_suspended() => "suspended".to_string(),
            None => "active".to_string(),
        };
        println!(
            "{}\tlast sync: {}\tcursor: {}\t{}",
            account.id,
            last_sync,
            account.last_sync_cursor.as_deref().unwrap_or("-"),
            state
        );
    }
    Ok(())
}

fn show_history(store: &dyn SyncStore, id: &AccountId, limit: usize) -> Result<()> {
    let runs = store.list_runs(id, limit)?;
    if runs.is_empty() {
        println!("No runs recorded for {}", id);
        return Ok(());
    }

    for run in runs {
        println!(
            "{}\t{}\t{}\t{} pages\t+{} ~{} ={} !{}{}",
            run.started_at.to_rfc3339(),
            run.outcome.map(|o| o.as_str()).unwrap_or("active"),
            run.stop_reason.map(|r| r.as_str()).unwrap_or("-"),
            run.pages_fetched,
            run.inserted,
            run.updated,
            run.unchanged,
            run.failed,
            run.error.as_ref().map(|e| format!("\t{}", e)).unwrap_or_default()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = open_store(&config)?;

    match cli.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => run(config, store, once).await?,
        Commands::AddAccount { id, credential_ref } => {
            store.register_account(Account::new(id.as_str(), credential_ref))?;
            println!("Registered {}", id);
        }
        Commands::Accounts => list_accounts(store.as_ref())?,
        Commands::Reinstate { id } => {
            if store.reinstate_account(&AccountId::new(&id))? {
                println!("Reinstated {}", id);
            } else {
                println!("{} was not suspended", id);
            }
        }
        Commands::History { id, limit } => show_history(store.as_ref(), &AccountId::new(id), limit)?,
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_starts_shutdown() {
        let mut shutdown = ShutdownSignal::install().unwrap();

        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), shutdown.recv())
            .await
            .expect("no shutdown signal within 5s")
            .unwrap();
        assert_eq!(signal, "SIGTERM");
    }
}
