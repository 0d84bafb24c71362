use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::spend::SpendExecutor;
use crate::aggregate::summary::SummaryExecutor;
use crate::alert::{AlertSink, LogAlertSink};
use crate::backend::clickhouse::ClickHouseBackend;
use crate::backend::AggregationBackend;
use crate::checkpoint::clickhouse::ClickHouseCheckpointStore;
use crate::checkpoint::CheckpointStore;
use crate::clock::TickClock;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseConnection;
use crate::freshness::FreshnessMonitor;
use crate::migrate::{ClickHouseMigrator, Migrator};

pub type ClickHouseSummaryExecutor =
    SummaryExecutor<ClickHouseBackend, ClickHouseCheckpointStore, Arc<LogAlertSink>>;
pub type ClickHouseSpendExecutor =
    SpendExecutor<ClickHouseBackend, ClickHouseCheckpointStore, Arc<LogAlertSink>>;
pub type ClickHouseFreshnessMonitor =
    FreshnessMonitor<ClickHouseCheckpointStore, Arc<LogAlertSink>>;

/// ClickHouse-backed building blocks shared by the scheduler and the
/// administrative commands.
pub struct Components {
    pub backend: Arc<ClickHouseBackend>,
    pub checkpoints: Arc<ClickHouseCheckpointStore>,
    pub alerts: Arc<LogAlertSink>,
    health: Option<Arc<HealthMetrics>>,
}

impl Components {
    pub fn new(
        cfg: &Config,
        connection: &ClickHouseConnection,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let pool = connection.require_pool()?;
        let ch = &cfg.clickhouse;

        Ok(Self {
            backend: Arc::new(ClickHouseBackend::new(
                pool.clone(),
                ch.database.clone(),
                cfg.counter_set(),
                ch.query_timeout,
            )),
            checkpoints: Arc::new(ClickHouseCheckpointStore::new(
                pool,
                ch.database.clone(),
                ch.query_timeout,
            )),
            alerts: Arc::new(LogAlertSink::new(health.clone())),
            health,
        })
    }

    pub fn summary_executor(
        &self,
        cfg: &Config,
        started_at: DateTime<Utc>,
    ) -> Result<ClickHouseSummaryExecutor> {
        Ok(SummaryExecutor::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.alerts),
            cfg.summary_settings()?,
        )
        .with_started_at(started_at)
        .with_health(self.health.clone()))
    }

    pub fn spend_executor(&self, cfg: &Config) -> Result<ClickHouseSpendExecutor> {
        Ok(SpendExecutor::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.alerts),
            cfg.spend_settings()?,
        )
        .with_health(self.health.clone()))
    }

    pub fn freshness_monitor(
        &self,
        cfg: &Config,
        started_at: DateTime<Utc>,
    ) -> Result<ClickHouseFreshnessMonitor> {
        Ok(FreshnessMonitor::new(
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.alerts),
            cfg.freshness_settings()?,
        )
        .with_started_at(started_at)
        .with_health(self.health.clone()))
    }
}

/// Agent owns the ClickHouse connection, health server and the periodic
/// summary, spend and freshness loops.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    connection: Option<ClickHouseConnection>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            connection: None,
            tasks: Vec::with_capacity(3),
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        })
    }

    /// Connects, migrates and spawns every enabled loop.
    pub async fn start(&mut self) -> Result<()> {
        self.cfg.require_clickhouse()?;

        // Health first so probes respond during migrations.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        info!("health metrics server started");

        let mut connection = ClickHouseConnection::new(self.cfg.clickhouse.clone());
        connection
            .start()
            .await
            .context("connecting to ClickHouse")?;
        self.health.clickhouse_connected.set(1.0);

        if self.cfg.clickhouse.migrations.enabled {
            info!("running ClickHouse migrations");
            ClickHouseMigrator::new(connection.require_pool()?, self.cfg.clickhouse.query_timeout)
                .up()
                .await
                .context("applying ClickHouse migrations")?;
        }

        let components = Components::new(&self.cfg, &connection, Some(Arc::clone(&self.health)))?;
        self.connection = Some(connection);

        if self.cfg.summary.enabled {
            let executor = Arc::new(components.summary_executor(&self.cfg, self.started_at)?);
            let clock = TickClock::new(executor.settings().planner.interval())?;
            self.tasks.push(tokio::spawn(run_summary_loop(
                executor,
                clock,
                self.cancel.child_token(),
            )));
        } else {
            info!("summary stream disabled");
        }

        if self.cfg.spend.enabled {
            let executor = Arc::new(components.spend_executor(&self.cfg)?);
            self.tasks.push(tokio::spawn(run_spend_loop(
                executor,
                self.cfg.spend.initial_delay,
                self.cfg.spend.refresh_period,
                self.cancel.child_token(),
            )));
        } else {
            info!("spend stream disabled");
        }

        if self.cfg.freshness.enabled {
            let monitor = Arc::new(components.freshness_monitor(&self.cfg, self.started_at)?);
            self.tasks.push(tokio::spawn(run_freshness_loop(
                monitor,
                self.cfg.freshness.check_interval,
                self.cancel.child_token(),
            )));
        } else {
            info!("freshness monitor disabled");
        }

        info!(
            service_instance_id = %self.cfg.service_instance_id,
            loops = self.tasks.len(),
            "agent fully started",
        );

        Ok(())
    }

    /// Stops scheduling new ticks and waits for in-flight ticks to finish.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task panicked");
            }
        }

        if let Some(connection) = &mut self.connection {
            if let Err(e) = connection.stop().await {
                error!(error = %e, "error closing ClickHouse connection");
            }
            self.health.clickhouse_connected.set(0.0);
        }

        self.health.stop().await?;

        Ok(())
    }
}

/// Runs the summary stream on interval-aligned ticks until cancelled.
///
/// Each run plans from the aligned tick instant rather than the wall clock,
/// so a late wakeup still produces windows on the interval grid.
/// Cancellation is only observed between ticks.
pub async fn run_summary_loop<B, C, A>(
    executor: Arc<SummaryExecutor<B, C, A>>,
    clock: TickClock,
    cancel: CancellationToken,
) where
    B: AggregationBackend + 'static,
    C: CheckpointStore + 'static,
    A: AlertSink + 'static,
{
    info!(interval_minutes = clock.interval().num_minutes(), "summary loop started");

    while let Some(tick) = clock.wait_for_tick(&cancel).await {
        debug!(%tick, "summary tick");
        executor.run_scheduled(tick).await;
    }

    info!("summary loop stopped");
}

/// Runs the spend stream with a fixed delay between runs until cancelled.
pub async fn run_spend_loop<B, C, A>(
    executor: Arc<SpendExecutor<B, C, A>>,
    initial_delay: Duration,
    refresh_period: Duration,
    cancel: CancellationToken,
) where
    B: AggregationBackend + 'static,
    C: CheckpointStore + 'static,
    A: AlertSink + 'static,
{
    info!(?initial_delay, ?refresh_period, "spend loop started");

    let mut delay = initial_delay;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if executor.run_scheduled(Utc::now()).await.is_none() {
            debug!("spend run produced no outcome");
        }

        delay = refresh_period;
    }

    info!("spend loop stopped");
}

/// Checks summary freshness at a fixed rate until cancelled.
pub async fn run_freshness_loop<C, A>(
    monitor: Arc<FreshnessMonitor<C, A>>,
    check_interval: Duration,
    cancel: CancellationToken,
) where
    C: CheckpointStore + 'static,
    A: AlertSink + 'static,
{
    info!(?check_interval, "freshness loop started");

    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; checking before the first
    // summary tick would only report startup state.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(alert) = monitor.run_scheduled(Utc::now()).await {
                    warn!(alert = %alert.name, "freshness check raised an alert");
                }
            }
        }
    }

    info!("freshness loop stopped");
}
