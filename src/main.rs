use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use windowfold::agent::{Agent, Components};
use windowfold::backend::KeyFilter;
use windowfold::checkpoint::parse_instant;
use windowfold::config::Config;
use windowfold::export::ClickHouseConnection;
use windowfold::migrate::{ClickHouseMigrator, Migrator};

/// Checkpointed window aggregation service for telemetry records.
#[derive(Parser)]
#[command(name = "windowfold", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the configured log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduled summary, spend and freshness loops (default).
    Run,

    /// Rebuild summaries for an explicit window.
    Recreate {
        #[arg(long, value_parser = parse_instant)]
        start: DateTime<Utc>,

        #[arg(long, value_parser = parse_instant)]
        end: DateTime<Utc>,

        /// Delete existing summaries in the window first.
        #[arg(long)]
        overwrite: bool,
    },

    /// Aggregate an explicit window without moving the stream checkpoint.
    Aggregate {
        #[arg(long, value_enum, default_value_t = Stream::Summary)]
        stream: Stream,

        #[arg(long, value_parser = parse_instant)]
        start: DateTime<Utc>,

        #[arg(long, value_parser = parse_instant)]
        end: DateTime<Utc>,

        /// Comma separated logical keys (summary stream only).
        #[arg(long)]
        keys: Option<String>,
    },

    /// Manage the ClickHouse schema.
    Migrate {
        #[arg(value_enum)]
        action: MigrateAction,
    },

    /// Print the last window end recorded per producer and key.
    Freshness,

    /// Print version information and exit.
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum Stream {
    Summary,
    Spend,
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateAction {
    Up,
    Down,
    Status,
}

/// Build-time version info, injected via build.rs.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("windowfold {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_yaml("{}").context("building default config")?,
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run(cfg).await,
            Command::Recreate {
                start,
                end,
                overwrite,
            } => recreate(cfg, start, end, overwrite).await,
            Command::Aggregate {
                stream,
                start,
                end,
                keys,
            } => aggregate(cfg, stream, start, end, keys).await,
            Command::Migrate { action } => migrate(cfg, action).await,
            Command::Freshness => freshness(cfg).await,
            Command::Version => Ok(()),
        }
    })
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting windowfold",
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("windowfold stopped");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

async fn connect(cfg: &Config) -> Result<ClickHouseConnection> {
    cfg.require_clickhouse()?;

    let mut connection = ClickHouseConnection::new(cfg.clickhouse.clone());
    connection
        .start()
        .await
        .context("connecting to ClickHouse")?;

    Ok(connection)
}

async fn recreate(
    cfg: Config,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    overwrite: bool,
) -> Result<()> {
    let connection = connect(&cfg).await?;
    let components = Components::new(&cfg, &connection, None)?;
    let executor = components.summary_executor(&cfg, Utc::now())?;

    let outcome = executor.recreate(start, end, overwrite).await?;
    print_json(&outcome)
}

async fn aggregate(
    cfg: Config,
    stream: Stream,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    keys: Option<String>,
) -> Result<()> {
    let connection = connect(&cfg).await?;
    let components = Components::new(&cfg, &connection, None)?;

    match stream {
        Stream::Summary => {
            let executor = components.summary_executor(&cfg, Utc::now())?;
            let filter = keys.as_deref().map(KeyFilter::parse);

            let outcome = match filter.filter(|f| !f.is_empty()) {
                Some(filter) => executor.run_explicit_window_for(start, end, &filter).await?,
                None => executor.run_explicit_window(start, end).await?,
            };
            print_json(&outcome)
        }
        Stream::Spend => {
            if keys.is_some() {
                anyhow::bail!("--keys is only supported for the summary stream");
            }

            let executor = components.spend_executor(&cfg)?;
            let outcome = executor.run_explicit_window(start, end).await?;
            print_json(&outcome)
        }
    }
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let connection = connect(&cfg).await?;
    let migrator =
        ClickHouseMigrator::new(connection.require_pool()?, cfg.clickhouse.query_timeout);

    match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => print_json(&migrator.status().await?),
    }
}

async fn freshness(cfg: Config) -> Result<()> {
    let connection = connect(&cfg).await?;
    let components = Components::new(&cfg, &connection, None)?;
    let monitor = components.freshness_monitor(&cfg, Utc::now())?;

    print_json(&monitor.states().await?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{out}");
    Ok(())
}
