use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertName, AlertSink, Severity};
use crate::backend::{AggregationBackend, KeyFilter};
use crate::checkpoint::{freshness_marker, CheckpointStore, SUMMARY_STREAM};
use crate::error::AggregationError;
use crate::export::health::HealthMetrics;
use crate::window::planner::{self, PlannerConfig, SkippedRange};
use crate::window::AggregationWindow;

use super::{error_type, RunMode, WindowOutcome};

const STREAM: &str = "summary";

/// Summary stream parameters.
#[derive(Debug, Clone)]
pub struct SummarySettings {
    pub planner: PlannerConfig,
    pub service_instance_id: String,
    /// Skip scheduled ticks until one interval has passed since start.
    pub startup_grace: bool,
}

/// Outcome of one scheduled summary tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryTick {
    /// The tick fell inside the startup grace period and did nothing.
    pub deferred: bool,
    /// Backlog dropped by the catch-up bound.
    pub skipped_range: Option<SkippedRange>,
    pub windows: Vec<WindowOutcome>,
    /// Error alerted and swallowed, if the tick failed.
    pub error: Option<String>,
}

impl SummaryTick {
    pub fn written(&self) -> u64 {
        self.windows.iter().map(|w| w.written).sum()
    }
}

/// Runs the summary stream: plans windows from the stream checkpoint, rolls
/// raw records into per-key summary rows and advances cursors after each
/// successful write.
pub struct SummaryExecutor<B, C, A> {
    backend: Arc<B>,
    checkpoints: Arc<C>,
    alerts: A,
    settings: SummarySettings,
    started_at: DateTime<Utc>,
    health: Option<Arc<HealthMetrics>>,
}

impl<B, C, A> SummaryExecutor<B, C, A>
where
    B: AggregationBackend,
    C: CheckpointStore,
    A: AlertSink,
{
    pub fn new(backend: Arc<B>, checkpoints: Arc<C>, alerts: A, settings: SummarySettings) -> Self {
        Self {
            backend,
            checkpoints,
            alerts,
            settings,
            started_at: Utc::now(),
            health: None,
        }
    }

    /// Overrides the process start time used for the startup grace period.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    pub fn settings(&self) -> &SummarySettings {
        &self.settings
    }

    /// Scheduled entry point. Failures are alerted and swallowed so the
    /// schedule survives; the checkpoint then stays at the last good window.
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> SummaryTick {
        let mut tick = SummaryTick::default();
        let interval = self.settings.planner.interval();

        if self.settings.startup_grace && self.started_at + interval > now {
            info!(
                started_at = %self.started_at,
                interval_minutes = interval.num_minutes(),
                "startup less than one interval ago, deferring summary run to next tick",
            );
            tick.deferred = true;
            self.record_run("skipped", 0.0);
            return tick;
        }

        let started = Instant::now();
        let outcome = self.run_planned(now, &mut tick).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                info!(
                    windows = tick.windows.len(),
                    written = tick.written(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "completed scheduled summary run",
                );
                self.record_run("ok", elapsed.as_secs_f64());
            }
            Err(err) => {
                self.alert_failure("Unexpected problem in scheduled summary aggregation", &err);
                tick.error = Some(err.to_string());
                self.record_run("error", elapsed.as_secs_f64());
            }
        }

        tick
    }

    async fn run_planned(
        &self,
        now: DateTime<Utc>,
        tick: &mut SummaryTick,
    ) -> Result<(), AggregationError> {
        let last = self
            .checkpoints
            .get(SUMMARY_STREAM)
            .await
            .map_err(AggregationError::Checkpoint)?
            .map(|cp| cp.value);

        let plan = planner::plan(now, last, &self.settings.planner);

        if let Some(skipped) = plan.skipped {
            self.alerts.raise(Alert::new(
                AlertName::SummaryAggregationError,
                Severity::High,
                format!(
                    "Missing summary reports from {} to {}",
                    skipped.from.to_rfc3339(),
                    skipped.to.to_rfc3339()
                ),
            ));

            if let Some(h) = &self.health {
                h.catchup_skipped_seconds
                    .inc_by(skipped.duration().num_seconds() as f64);
            }

            tick.skipped_range = Some(skipped);
        }

        info!(
            checkpoint = ?last,
            first_start = %plan.first_start,
            final_end = %plan.final_end,
            windows = plan.window_count(),
            "running scheduled summary",
        );

        for window in plan.windows() {
            let outcome = self.execute(&window, RunMode::Incremental, None).await?;
            tick.windows.push(outcome);
        }

        if let Some(h) = &self.health {
            let cursor = tick.windows.last().map(|w| w.end).or(last);
            if let Some(cursor) = cursor {
                h.checkpoint_lag_seconds
                    .with_label_values(&[STREAM])
                    .set((now - cursor).num_seconds() as f64);
            }
        }

        Ok(())
    }

    /// Aggregates `[start, end)` in the given mode.
    ///
    /// `Recreate` behaves like [`Self::recreate`] without overwrite: a
    /// populated window is refused with a conflict.
    pub async fn run_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mode: RunMode,
    ) -> Result<WindowOutcome, AggregationError> {
        match mode {
            RunMode::Incremental => {
                let window = AggregationWindow::new(start, end)?;
                self.execute(&window, mode, None).await
            }
            RunMode::Recreate => self.recreate(start, end, false).await,
        }
    }

    /// Rebuilds summaries for `[start, end)`.
    ///
    /// Existing rows are deleted only when `overwrite` is set; otherwise a
    /// populated window is refused with the conflicting row count. The stream
    /// checkpoint is never touched.
    pub async fn recreate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        overwrite: bool,
    ) -> Result<WindowOutcome, AggregationError> {
        let window = AggregationWindow::new(start, end)?;

        let result = self.recreate_window(&window, overwrite).await;
        self.report_admin(&window, result, "recreate")
    }

    async fn recreate_window(
        &self,
        window: &AggregationWindow,
        overwrite: bool,
    ) -> Result<WindowOutcome, AggregationError> {
        if overwrite {
            let deleted = self.backend.delete(window).await?;
            info!(%window, deleted, "deleted existing summaries before recreate");
        } else {
            let existing = self.backend.count(window).await?;
            if existing > 0 {
                return Err(AggregationError::Conflict { existing });
            }
        }

        self.execute(window, RunMode::Recreate, None).await
    }

    /// Aggregates explicit bounds without reading or advancing the checkpoint.
    pub async fn run_explicit_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<WindowOutcome, AggregationError> {
        let window = AggregationWindow::new(start, end)?;

        let result = self.execute(&window, RunMode::Recreate, None).await;
        self.report_admin(&window, result, "explicit")
    }

    /// Like [`Self::run_explicit_window`], restricted to the filtered keys.
    pub async fn run_explicit_window_for(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &KeyFilter,
    ) -> Result<WindowOutcome, AggregationError> {
        let window = AggregationWindow::new(start, end)?;

        let result = self.execute(&window, RunMode::Recreate, Some(filter)).await;
        self.report_admin(&window, result, "explicit")
    }

    /// Aggregates one window, writes rows, then moves the cursors.
    ///
    /// Cursors are written only after the rows are stored, so a failed write
    /// leaves the window to be retried on the next tick.
    async fn execute(
        &self,
        window: &AggregationWindow,
        mode: RunMode,
        filter: Option<&KeyFilter>,
    ) -> Result<WindowOutcome, AggregationError> {
        let started = Instant::now();
        let mut outcome = WindowOutcome::new(window);

        let batch = self.backend.aggregate(window, filter).await?;
        outcome.skipped = batch.skipped;

        if batch.skipped > 0 {
            warn!(%window, skipped = batch.skipped, "excluded malformed records from summary");
        }

        outcome.written = self.backend.upsert_summaries(&batch.rows).await?;

        let kind = mode.marker_kind();
        for key in &batch.observed {
            let name = freshness_marker(
                &self.settings.service_instance_id,
                &key.producer_code,
                &key.logical_key,
                kind,
            );
            self.checkpoints
                .put(&name, window.end())
                .await
                .map_err(AggregationError::Checkpoint)?;
        }
        outcome.markers = batch.observed.len();

        if mode == RunMode::Incremental {
            self.checkpoints
                .put(SUMMARY_STREAM, window.end())
                .await
                .map_err(AggregationError::Checkpoint)?;
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
            mode = mode.as_str(),
            written = outcome.written,
            skipped = outcome.skipped,
            markers = outcome.markers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "summary window aggregated",
        );

        Ok(outcome)
    }

    /// Alerts non-validation failures of administrative calls and hands the
    /// result back to the caller.
    fn report_admin(
        &self,
        window: &AggregationWindow,
        result: Result<WindowOutcome, AggregationError>,
        kind: &str,
    ) -> Result<WindowOutcome, AggregationError> {
        match &result {
            Ok(_) => self.record_run("ok", 0.0),
            Err(err) if err.is_validation() => {
                debug!(%window, kind, error = %err, "rejected summary request");
                self.record_error(err);
            }
            Err(err) => {
                let context =
                    format!("Unexpected problem in {kind} summary aggregation for {window}");
                self.alert_failure(&context, err);
                self.record_run("error", 0.0);
            }
        }

        result
    }

    fn alert_failure(&self, context: &str, err: &AggregationError) {
        self.record_error(err);
        self.alerts.raise(Alert::new(
            AlertName::SummaryAggregationError,
            Severity::High,
            format!("{context}: {err:#}"),
        ));
    }

    fn record_error(&self, err: &AggregationError) {
        if let Some(h) = &self.health {
            h.aggregation_errors
                .with_label_values(&[STREAM, error_type(err)])
                .inc();
        }
    }

    fn record_run(&self, outcome: &str, elapsed_secs: f64) {
        if let Some(h) = &self.health {
            h.record_run(STREAM, outcome, elapsed_secs);
        }
    }
}
