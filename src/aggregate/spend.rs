use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertName, AlertSink, Severity};
use crate::backend::AggregationBackend;
use crate::checkpoint::{CheckpointStore, SPEND_STREAM};
use crate::error::AggregationError;
use crate::export::health::HealthMetrics;
use crate::window::AggregationWindow;

use super::error_type;

const STREAM: &str = "spend";

/// Spend stream parameters.
#[derive(Debug, Clone)]
pub struct SpendSettings {
    /// Oldest data a scheduled run will read, relative to now.
    pub max_lookback: TimeDelta,
    pub service_instance_id: String,
}

/// Result of one spend run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendOutcome {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub partitions: usize,
    pub written: u64,
    pub skipped: u64,
}

/// Runs the spend stream: keeps one latest-value row per
/// (vendor, region, instance, producer, key), refreshed from the records
/// received since the previous run.
pub struct SpendExecutor<B, C, A> {
    backend: Arc<B>,
    checkpoints: Arc<C>,
    alerts: A,
    settings: SpendSettings,
    health: Option<Arc<HealthMetrics>>,
}

impl<B, C, A> SpendExecutor<B, C, A>
where
    B: AggregationBackend,
    C: CheckpointStore,
    A: AlertSink,
{
    pub fn new(backend: Arc<B>, checkpoints: Arc<C>, alerts: A, settings: SpendSettings) -> Self {
        Self {
            backend,
            checkpoints,
            alerts,
            settings,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    /// Start of the next scheduled run: the stream checkpoint, but never
    /// older than `now - max_lookback`.
    pub async fn determine_start(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, AggregationError> {
        let floor = now - self.settings.max_lookback;
        let last = self
            .checkpoints
            .get(SPEND_STREAM)
            .await
            .map_err(AggregationError::Checkpoint)?;

        Ok(match last {
            Some(cp) if cp.value > floor => cp.value,
            _ => floor,
        })
    }

    /// Scheduled entry point covering `[start, now)`.
    ///
    /// Returns `None` when there was nothing to do or the run failed; failures
    /// are alerted and the checkpoint is left in place.
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> Option<SpendOutcome> {
        let started = Instant::now();

        match self.run_incremental(now).await {
            Ok(outcome) => {
                self.record_run("ok", started.elapsed().as_secs_f64());
                outcome
            }
            Err(err) => {
                self.alert_failure("Unexpected problem in aggregating spend summaries", &err);
                self.record_run("error", started.elapsed().as_secs_f64());
                None
            }
        }
    }

    async fn run_incremental(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<SpendOutcome>, AggregationError> {
        let start = self.determine_start(now).await?;
        if start >= now {
            debug!(%start, %now, "spend checkpoint is current, nothing to aggregate");
            return Ok(None);
        }

        let window = AggregationWindow::new(start, now)?;
        let outcome = self.execute(&window).await?;

        self.checkpoints
            .put(SPEND_STREAM, window.end())
            .await
            .map_err(AggregationError::Checkpoint)?;

        if let Some(h) = &self.health {
            h.checkpoint_lag_seconds.with_label_values(&[STREAM]).set(0.0);
        }

        Ok(Some(outcome))
    }

    /// Aggregates explicit bounds without reading or advancing the checkpoint.
    pub async fn run_explicit_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SpendOutcome, AggregationError> {
        let window = AggregationWindow::new(start, end)?;

        let result = self.execute(&window).await;
        if let Err(err) = &result {
            if !err.is_validation() {
                self.alert_failure(
                    &format!("Unexpected problem in explicit spend aggregation for {window}"),
                    err,
                );
            }
        }

        result
    }

    /// Upserts every (vendor, region) partition of the window.
    ///
    /// The first failing partition aborts the run; partitions are a batching
    /// unit, not a recovery boundary.
    async fn execute(&self, window: &AggregationWindow) -> Result<SpendOutcome, AggregationError> {
        let started = Instant::now();

        let keys = self.backend.distinct_grouping_keys(window).await?;
        info!(%window, partitions = keys.len(), "running spend aggregation");

        let mut outcome = SpendOutcome {
            start: window.start(),
            end: window.end(),
            partitions: keys.len(),
            written: 0,
            skipped: 0,
        };

        for key in &keys {
            let batch = self
                .backend
                .upsert_latest_values(window, key, &self.settings.service_instance_id)
                .await?;

            if batch.skipped > 0 {
                warn!(
                    vendor = %key.vendor,
                    region = %key.region,
                    skipped = batch.skipped,
                    "dropped records missing spend keys",
                );
            }

            outcome.written += batch.written;
            outcome.skipped += batch.skipped;
        }

        if let Some(h) = &self.health {
            h.windows_processed.with_label_values(&[STREAM]).inc();
            h.rows_written
                .with_label_values(&[STREAM])
                .inc_by(outcome.written as f64);
            h.records_skipped
                .with_label_values(&[STREAM])
                .inc_by(outcome.skipped as f64);
        }

        info!(
            %window,
            partitions = outcome.partitions,
            written = outcome.written,
            skipped = outcome.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "spend window aggregated",
        );

        Ok(outcome)
    }

    fn alert_failure(&self, context: &str, err: &AggregationError) {
        if let Some(h) = &self.health {
            h.aggregation_errors
                .with_label_values(&[STREAM, error_type(err)])
                .inc();
        }

        self.alerts.raise(Alert::new(
            AlertName::SpendAggregationError,
            Severity::High,
            format!("{context}: {err:#}"),
        ));
    }

    fn record_run(&self, outcome: &str, elapsed_secs: f64) {
        if let Some(h) = &self.health {
            h.record_run(STREAM, outcome, elapsed_secs);
        }
    }
}
