use std::fmt::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::alert::{Alert, AlertName, AlertSink, Severity};
use crate::checkpoint::{CheckpointStore, MarkerKind, MarkerRef, SUMMARY_STREAM};
use crate::export::health::HealthMetrics;
use crate::window::planner::interval_span;

/// Freshness monitor parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessSettings {
    /// Summary stream interval.
    pub interval: TimeDelta,
    pub max_aggregate_intervals: u32,
    threshold: TimeDelta,
    /// How far back marker updates are considered for gap detection.
    pub marker_lookback: TimeDelta,
}

impl FreshnessSettings {
    pub fn new(
        interval: TimeDelta,
        max_aggregate_intervals: u32,
        marker_lookback: TimeDelta,
    ) -> Result<Self> {
        if interval <= TimeDelta::zero() {
            bail!("freshness interval must be positive");
        }

        if max_aggregate_intervals == 0 {
            bail!("max_aggregate_intervals must be > 0");
        }

        if marker_lookback <= TimeDelta::zero() {
            bail!("marker_lookback must be positive");
        }

        let threshold = interval_span(interval, max_aggregate_intervals)
            .context("max_aggregate_intervals is too large")?;

        Ok(Self {
            interval,
            max_aggregate_intervals,
            threshold,
            marker_lookback,
        })
    }

    /// Longest tolerated silence.
    pub fn threshold(&self) -> TimeDelta {
        self.threshold
    }
}

/// Last window end recorded for one producer/key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerState {
    #[serde(flatten)]
    pub marker: MarkerRef,
    pub window_end: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Detects a stalled summary stream and gaps between per-key markers.
pub struct FreshnessMonitor<C, A> {
    checkpoints: Arc<C>,
    alerts: A,
    settings: FreshnessSettings,
    started_at: DateTime<Utc>,
    health: Option<Arc<HealthMetrics>>,
}

impl<C, A> FreshnessMonitor<C, A>
where
    C: CheckpointStore,
    A: AlertSink,
{
    pub fn new(checkpoints: Arc<C>, alerts: A, settings: FreshnessSettings) -> Self {
        Self {
            checkpoints,
            alerts,
            settings,
            started_at: Utc::now(),
            health: None,
        }
    }

    /// Overrides the process start time used when the stream has no checkpoint.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    /// Evaluates freshness at `now` without raising anything.
    ///
    /// Staleness and gap findings are folded into a single alert.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<Option<Alert>> {
        let threshold = self.settings.threshold();
        let mut message = String::new();

        let last_run = self
            .checkpoints
            .get(SUMMARY_STREAM)
            .await?
            .map(|cp| cp.value)
            .unwrap_or(self.started_at);

        if last_run < now - threshold {
            let _ = write!(
                message,
                "Summary aggregation has not run since::{}.",
                last_run.to_rfc3339()
            );
        }

        let mut markers = self
            .checkpoints
            .list_by_pattern(
                &MarkerKind::Fresh.pattern(),
                now - self.settings.marker_lookback,
            )
            .await?;
        markers.sort_by(|a, b| b.value.cmp(&a.value));

        let gaps = find_gaps(markers.iter().map(|cp| cp.value), threshold);
        if !gaps.is_empty() {
            message.push_str("Summary aggregation failed to run within intervals::");
            for (older, newer) in gaps {
                let _ = write!(message, "[{}, {}]", older.to_rfc3339(), newer.to_rfc3339());
            }
        }

        debug!(
            last_run = %last_run,
            markers = markers.len(),
            stale = !message.is_empty(),
            "freshness evaluated",
        );

        if message.is_empty() {
            return Ok(None);
        }

        Ok(Some(Alert::new(
            AlertName::FreshnessError,
            Severity::Medium,
            message,
        )))
    }

    /// Scheduled entry point. Raises at most one alert per tick.
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> Option<Alert> {
        let alert = match self.check(now).await {
            Ok(alert) => alert,
            Err(err) => Some(Alert::new(
                AlertName::FreshnessError,
                Severity::High,
                format!("Unexpected problem checking summary freshness: {err:#}"),
            )),
        };

        let outcome = if alert.is_some() { "alerted" } else { "ok" };
        if let Some(h) = &self.health {
            h.record_run("freshness", outcome, 0.0);
        }

        if let Some(alert) = &alert {
            self.alerts.raise(alert.clone());
        } else {
            info!("summary aggregation is fresh");
        }

        alert
    }

    /// Every fresh marker, oldest window end first, then by producer and key.
    pub async fn states(&self) -> Result<Vec<MarkerState>> {
        let markers = self
            .checkpoints
            .list_by_pattern(&MarkerKind::Fresh.pattern(), DateTime::UNIX_EPOCH)
            .await?;

        let mut states: Vec<MarkerState> = markers
            .into_iter()
            .filter_map(|cp| {
                let marker = MarkerRef::parse(&cp.name, MarkerKind::Fresh)?;
                Some(MarkerState {
                    marker,
                    window_end: cp.value,
                    updated_at: cp.updated_at,
                })
            })
            .collect();

        states.sort_by(|a, b| {
            a.window_end
                .cmp(&b.window_end)
                .then_with(|| a.marker.producer_code.cmp(&b.marker.producer_code))
                .then_with(|| a.marker.logical_key.cmp(&b.marker.logical_key))
        });

        Ok(states)
    }
}

/// Adjacent pairs of a descending sequence further apart than `threshold`,
/// as `(older, newer)`.
fn find_gaps(
    values: impl IntoIterator<Item = DateTime<Utc>>,
    threshold: TimeDelta,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut gaps = Vec::new();
    let mut iter = values.into_iter();
    let Some(mut newer) = iter.next() else {
        return gaps;
    };

    for older in iter {
        if newer - older > threshold {
            gaps.push((older, newer));
        }
        newer = older;
    }

    gaps
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::checkpoint::{freshness_marker, MemoryCheckpointStore};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, h, m, 0)
            .single()
            .expect("valid timestamp")
    }

    fn monitor(
        checkpoints: &Arc<MemoryCheckpointStore>,
        alerts: &Arc<MemoryAlertSink>,
        interval_minutes: i64,
        max_intervals: u32,
    ) -> FreshnessMonitor<MemoryCheckpointStore, Arc<MemoryAlertSink>> {
        let settings = FreshnessSettings::new(
            TimeDelta::minutes(interval_minutes),
            max_intervals,
            TimeDelta::hours(1),
        )
        .expect("valid settings");

        FreshnessMonitor::new(Arc::clone(checkpoints), Arc::clone(alerts), settings)
            .with_started_at(at(0, 0))
    }

    #[test]
    fn test_find_gaps() {
        let gaps = find_gaps(
            [at(3, 0), at(2, 55), at(2, 15)],
            TimeDelta::minutes(10),
        );
        assert_eq!(gaps, vec![(at(2, 15), at(2, 55))]);

        assert!(find_gaps([], TimeDelta::minutes(10)).is_empty());
        assert!(find_gaps([at(3, 0)], TimeDelta::minutes(10)).is_empty());
    }

    #[test]
    fn test_settings_validation() {
        assert!(FreshnessSettings::new(TimeDelta::zero(), 3, TimeDelta::hours(1)).is_err());
        assert!(FreshnessSettings::new(TimeDelta::minutes(5), 0, TimeDelta::hours(1)).is_err());
        assert!(FreshnessSettings::new(TimeDelta::minutes(5), 3, TimeDelta::zero()).is_err());

        let err = FreshnessSettings::new(TimeDelta::minutes(60), u32::MAX, TimeDelta::hours(1))
            .expect_err("threshold should overflow");
        assert!(err.to_string().contains("max_aggregate_intervals is too large"));
    }

    #[test]
    fn test_threshold_is_interval_multiple() {
        let settings = FreshnessSettings::new(TimeDelta::minutes(15), 4, TimeDelta::hours(1))
            .expect("valid settings");
        assert_eq!(settings.threshold(), TimeDelta::hours(1));
    }

    #[tokio::test]
    async fn test_stale_checkpoint_alerts() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        checkpoints.put_at(SUMMARY_STREAM, at(1, 0), at(1, 0));

        let m = monitor(&checkpoints, &alerts, 60, 3);
        let alert = m.run_scheduled(at(4, 1)).await.expect("stale");

        assert_eq!(alert.name, AlertName::FreshnessError);
        assert_eq!(alert.severity, Severity::Medium);
        assert_eq!(
            alert.message,
            "Summary aggregation has not run since::2020-01-01T01:00:00+00:00."
        );
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_checkpoint_is_quiet() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        checkpoints.put_at(SUMMARY_STREAM, at(1, 0), at(1, 0));

        let m = monitor(&checkpoints, &alerts, 60, 3);
        assert!(m.run_scheduled(at(4, 0)).await.is_none());
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_uses_start_time() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());

        let m = monitor(&checkpoints, &alerts, 60, 3);
        assert!(m.check(at(2, 0)).await.expect("check").is_none());

        let alert = m.check(at(3, 30)).await.expect("check").expect("stale");
        assert!(alert.message.contains("not run since::2020-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_gap_and_staleness_coalesce() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        checkpoints.put_at(SUMMARY_STREAM, at(0, 30), at(0, 30));

        let now = at(3, 0);
        for (key, value) in [("k1", at(3, 0)), ("k2", at(2, 55)), ("k3", at(2, 15))] {
            let name = freshness_marker("svc", "pA", key, MarkerKind::Fresh);
            checkpoints.put_at(&name, value, at(2, 59));
        }

        let m = monitor(&checkpoints, &alerts, 5, 2);
        m.run_scheduled(now).await.expect("alert");

        let raised = alerts.take();
        assert_eq!(raised.len(), 1);
        assert_eq!(
            raised[0].message,
            "Summary aggregation has not run since::2020-01-01T00:30:00+00:00.\
             Summary aggregation failed to run within intervals::\
             [2020-01-01T02:15:00+00:00, 2020-01-01T02:55:00+00:00]"
        );
    }

    #[tokio::test]
    async fn test_old_markers_are_ignored() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        checkpoints.put_at(SUMMARY_STREAM, at(3, 0), at(3, 0));

        let recent = freshness_marker("svc", "pA", "k1", MarkerKind::Fresh);
        let old = freshness_marker("svc", "pA", "k2", MarkerKind::Fresh);
        checkpoints.put_at(&recent, at(3, 0), at(3, 0));
        checkpoints.put_at(&old, at(1, 0), at(1, 0));

        let m = monitor(&checkpoints, &alerts, 5, 2);
        assert!(m.check(at(3, 5)).await.expect("check").is_none());
    }

    #[tokio::test]
    async fn test_states_lists_markers_oldest_first() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        checkpoints.put_at(
            &freshness_marker("svc", "pA", "k1", MarkerKind::Fresh),
            at(3, 0),
            at(3, 0),
        );
        checkpoints.put_at(
            &freshness_marker("svc", "pB", "k2", MarkerKind::Fresh),
            at(1, 0),
            at(1, 0),
        );
        checkpoints.put_at(
            &freshness_marker("svc", "pB", "k2", MarkerKind::Recreated),
            at(5, 0),
            at(5, 0),
        );

        let m = monitor(&checkpoints, &alerts, 60, 3);
        let states = m.states().await.expect("states");
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].marker.logical_key, "k2");
        assert_eq!(states[0].marker.producer_code, "pB");
        assert_eq!(states[1].window_end, at(3, 0));
    }
}
