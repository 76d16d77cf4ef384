//! tributary - feed a search index from a relational database
//!
//! ```bash
//! # Run all tasks on their schedules (default)
//! tributary -c tributary.yaml
//!
//! # Run every task once and exit
//! tributary -c tributary.yaml once
//!
//! # Validate configuration
//! tributary -c tributary.yaml validate
//!
//! # Inspect or pause a task
//! tributary -c tributary.yaml state products
//! tributary -c tributary.yaml suspend products
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tributary_rdbc::connection::{ConnectionConfig, ConnectionFactory};

use tributary::bulk::{HttpIndexClient, IndexLifecycle};
use tributary::config::{StateBackend, TributaryConfig};
use tributary::orchestrator::{BulkHandle, Orchestrator};
use tributary::state::{IndexStateStore, MemoryStateStore, StateStore, StateTracker};

#[derive(Parser)]
#[command(name = "tributary")]
#[command(version, about = "Incremental relational-to-search-index feeder")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tributary.yaml", env = "TRIBUTARY_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tasks on their schedules (default)
    Run,
    /// Run every task once and exit
    Once,
    /// Validate configuration file
    Validate,
    /// Show the stored run state of a task, or of all tasks
    State {
        /// Task name
        task: Option<String>,
    },
    /// Pause index writes of a task
    Suspend {
        /// Task name
        task: String,
    },
    /// Resume index writes of a task
    Resume {
        /// Task name
        task: String,
    },
    /// Let a disabled task run again when due
    Enable {
        /// Task name
        task: String,
    },
    /// Skip a task's runs until it is enabled
    Disable {
        /// Task name
        task: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = TributaryConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, false).await,
        Commands::Once => run(config, true).await,
        Commands::Validate => validate(&config),
        Commands::State { task } => show_state(&config, task).await,
        Commands::Suspend { task } => set_suspended(&config, &task, true).await,
        Commands::Resume { task } => set_suspended(&config, &task, false).await,
        Commands::Enable { task } => set_enabled(&config, &task, true).await,
        Commands::Disable { task } => set_enabled(&config, &task, false).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn state_store(config: &TributaryConfig, http: Arc<HttpIndexClient>) -> Arc<dyn StateStore> {
    match config.state.backend {
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
        StateBackend::IndexServer => Arc::new(IndexStateStore::new(http, config.state.index.clone())),
    }
}

#[cfg(feature = "postgres")]
fn connection_factory() -> Result<Arc<dyn ConnectionFactory>> {
    Ok(Arc::new(tributary_rdbc::postgres::PgConnectionFactory))
}

#[cfg(not(feature = "postgres"))]
fn connection_factory() -> Result<Arc<dyn ConnectionFactory>> {
    anyhow::bail!("built without a database backend; enable the `postgres` feature")
}

async fn run(config: TributaryConfig, once: bool) -> Result<()> {
    info!(tasks = config.tasks.len(), once, "Starting tributary");

    let http = Arc::new(HttpIndexClient::new(&config.index_server.http_config())?);
    let registry = Arc::new(config.registry(once)?);
    let state = StateTracker::new(state_store(&config, http.clone()));
    let bulk = Arc::new(BulkHandle::new(
        config.index_server.bulk.settings("tributary"),
        http.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(
        config.settings.orchestrator(),
        registry,
        connection_factory()?,
        state,
        bulk,
    )
    .with_cancellation(cancel.clone());
    if config.index_server.manage_indexes {
        orchestrator = orchestrator.with_lifecycle(IndexLifecycle::new(
            http,
            config.index_server.wait_for_status,
            config.index_server.health_timeout(),
        ));
    }
    let group = orchestrator.spawn();

    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => warn!("Unable to listen for shutdown signal: {}", e),
        }
    });

    let reports = group.join().await?;
    let mut failed = false;
    for report in &reports {
        match &report.last_error {
            Some(e) => {
                failed = true;
                error!(task = %report.name, runs = report.runs, failures = report.failures, error = %e, "Task finished with errors");
            }
            None => info!(task = %report.name, runs = report.runs, skipped = report.skipped, "Task finished"),
        }
    }
    if once && failed {
        anyhow::bail!("one or more tasks failed");
    }
    Ok(())
}

fn validate(config: &TributaryConfig) -> Result<()> {
    let registry = config.registry(false)?;
    println!("Configuration is valid");
    println!("  index server: {}", config.index_server.url);
    println!("  state: {:?} ({})", config.state.backend, config.state.index);
    for def in registry.all() {
        let connection: &ConnectionConfig = &def.fetch.connection;
        println!(
            "  task {}: {} strategy, {} statement(s), index {}, {:?}",
            def.name,
            def.fetch.strategy,
            def.fetch.commands.len(),
            def.index,
            connection.database_type(),
        );
    }
    Ok(())
}

async fn show_state(config: &TributaryConfig, task: Option<String>) -> Result<()> {
    let http = Arc::new(HttpIndexClient::new(&config.index_server.http_config())?);
    let tracker = StateTracker::new(state_store(config, http));

    let states = match task {
        Some(name) => {
            let task = config.task(&name)?;
            vec![tracker.load(&name, &task.task_type).await]
        }
        None => tracker.list().await?,
    };
    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}

async fn set_suspended(config: &TributaryConfig, name: &str, suspended: bool) -> Result<()> {
    let task = config.task(name)?;
    let http = Arc::new(HttpIndexClient::new(&config.index_server.http_config())?);
    let tracker = StateTracker::new(state_store(config, http));
    tracker
        .set_suspended(name, &task.task_type, suspended)
        .await
        .with_context(|| format!("Failed to update task {}", name))?;
    println!(
        "Task {} {}",
        name,
        if suspended { "suspended" } else { "resumed" }
    );
    Ok(())
}

async fn set_enabled(config: &TributaryConfig, name: &str, enabled: bool) -> Result<()> {
    let task = config.task(name)?;
    let http = Arc::new(HttpIndexClient::new(&config.index_server.http_config())?);
    let tracker = StateTracker::new(state_store(config, http));
    tracker
        .set_enabled(name, &task.task_type, enabled)
        .await
        .with_context(|| format!("Failed to update task {}", name))?;
    println!(
        "Task {} {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "postgres")]
    #[test]
    fn test_postgres_backend_available() {
        assert!(connection_factory().is_ok());
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn test_no_backend_without_postgres_feature() {
        let err = connection_factory().err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("`postgres` feature")));
    }
}
