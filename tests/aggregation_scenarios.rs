use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::json;

use windowfold::aggregate::spend::{SpendExecutor, SpendSettings};
use windowfold::aggregate::RunMode;
use windowfold::aggregate::summary::{SummaryExecutor, SummarySettings};
use windowfold::alert::{AlertName, MemoryAlertSink, Severity};
use windowfold::backend::memory::{BackendOp, MemoryBackend};
use windowfold::backend::{CounterSet, KeyFilter, RawRecord};
use windowfold::checkpoint::{
    freshness_marker, CheckpointStore, MarkerKind, MemoryCheckpointStore, SPEND_STREAM,
    SUMMARY_STREAM,
};
use windowfold::clock::TickClock;
use windowfold::error::AggregationError;
use windowfold::window::planner::PlannerConfig;

type Summary = SummaryExecutor<MemoryBackend, MemoryCheckpointStore, Arc<MemoryAlertSink>>;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, h, m, 0)
        .single()
        .expect("valid timestamp")
}

fn record(key: &str, t: DateTime<Utc>, auctions: i64, matched: i64) -> RawRecord {
    RawRecord {
        instance_id: "i-1".to_string(),
        producer_code: "pA".to_string(),
        logical_key: key.to_string(),
        ext_key: format!("ext-{key}"),
        vendor: "v1".to_string(),
        region: "us-east".to_string(),
        event_time: t,
        data_window_start: t - TimeDelta::minutes(1),
        data_window_end: t,
        payload: json!({ "accountAuctions": auctions, "targetMatched": matched }),
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    checkpoints: Arc<MemoryCheckpointStore>,
    alerts: Arc<MemoryAlertSink>,
}

impl Harness {
    fn new() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new(CounterSet {
                summary: vec!["accountAuctions".to_string(), "targetMatched".to_string()],
                spend: "targetMatched".to_string(),
            })),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            alerts: Arc::new(MemoryAlertSink::new()),
        }
    }

    fn summary(&self, max_catchup: u32) -> Summary {
        let planner = PlannerConfig::new(TimeDelta::minutes(60), max_catchup, 24, at(0, 0))
            .expect("valid planner");

        SummaryExecutor::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.alerts),
            SummarySettings {
                planner,
                service_instance_id: "svc-1".to_string(),
                startup_grace: true,
            },
        )
        .with_started_at(at(0, 0))
    }

    async fn summary_checkpoint(&self) -> Option<DateTime<Utc>> {
        self.checkpoints
            .get(SUMMARY_STREAM)
            .await
            .expect("read checkpoint")
            .map(|cp| cp.value)
    }
}

#[tokio::test]
async fn test_two_window_catchup_scenario() {
    let h = Harness::new();
    h.checkpoints
        .put(SUMMARY_STREAM, at(1, 0))
        .await
        .expect("seed checkpoint");
    h.backend.ingest([
        record("k1", at(1, 10), 1, 1),
        record("k1", at(1, 50), 2, 0),
        record("k2", at(2, 5), 5, 3),
        record("k1", at(3, 0), 100, 100),
    ]);

    let tick = h.summary(3).run_scheduled(at(3, 0)).await;

    assert!(tick.error.is_none());
    assert_eq!(tick.windows.len(), 2);
    assert_eq!((tick.windows[0].start, tick.windows[0].end), (at(1, 0), at(2, 0)));
    assert_eq!((tick.windows[1].start, tick.windows[1].end), (at(2, 0), at(3, 0)));
    assert_eq!(h.summary_checkpoint().await, Some(at(3, 0)));

    let rows = h.backend.summaries();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].logical_key, "k1");
    assert_eq!(rows[0].counters["accountAuctions"], 3);
    assert_eq!(rows[1].logical_key, "k2");
    assert_eq!(rows[1].report_window_start, at(2, 0));

    // The record at exactly 03:00 belongs to the next window.
    assert!(rows.iter().all(|r| r.counters["accountAuctions"] < 100));
    assert!(h.alerts.is_empty());
}

#[tokio::test]
async fn test_aligned_ticks_count_each_record_once() {
    let h = Harness::new();
    h.checkpoints
        .put(SUMMARY_STREAM, at(2, 0))
        .await
        .expect("seed checkpoint");
    h.backend.ingest([record("k1", at(2, 30), 1, 0), record("k1", at(3, 30), 1, 0)]);

    let executor = h.summary(3);
    let clock = TickClock::new(TimeDelta::minutes(60)).expect("clock");

    // A scheduler that woke up late still hands over the aligned tick.
    for woke_at in [at(3, 0), at(4, 1)] {
        let tick = clock.current_tick(woke_at);
        let outcome = executor.run_scheduled(tick).await;
        assert!(outcome.error.is_none());
        assert!(outcome
            .windows
            .iter()
            .all(|w| clock.current_tick(w.start) == w.start));
    }

    let rows = h.backend.summaries();
    let total: i64 = rows.iter().map(|r| r.counters["accountAuctions"]).sum();
    assert_eq!(total, 2);
    assert_eq!(rows.len(), 2);
    assert_eq!(h.summary_checkpoint().await, Some(at(4, 0)));
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = Harness::new();
    h.backend.ingest([record("k1", at(1, 10), 4, 2)]);
    let executor = h.summary(3);

    let first = executor
        .run_explicit_window(at(1, 0), at(2, 0))
        .await
        .expect("first run");
    let second = executor
        .run_explicit_window(at(1, 0), at(2, 0))
        .await
        .expect("second run");

    assert_eq!(first.written, second.written);
    let rows = h.backend.summaries();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].counters["accountAuctions"], 4);
    assert_eq!(h.summary_checkpoint().await, None);
}

#[tokio::test]
async fn test_incremental_window_twice_yields_same_rows() {
    let h = Harness::new();
    h.backend.ingest([record("k1", at(1, 10), 4, 2), record("k2", at(1, 40), 1, 1)]);
    let executor = h.summary(3);

    executor
        .run_window(at(1, 0), at(2, 0), RunMode::Incremental)
        .await
        .expect("first run");
    let first = h.backend.summaries();

    executor
        .run_window(at(1, 0), at(2, 0), RunMode::Incremental)
        .await
        .expect("second run");

    assert_eq!(h.backend.summaries(), first);
    assert_eq!(h.summary_checkpoint().await, Some(at(2, 0)));
}

#[tokio::test]
async fn test_recreate_conflict_and_overwrite() {
    let h = Harness::new();
    h.backend.ingest([record("k1", at(1, 10), 4, 2)]);
    let executor = h.summary(3);

    executor
        .recreate(at(1, 0), at(2, 0), false)
        .await
        .expect("empty window recreates");

    let err = executor
        .recreate(at(1, 0), at(2, 0), false)
        .await
        .expect_err("populated window conflicts");
    assert!(matches!(err, AggregationError::Conflict { existing: 1 }));
    assert!(err.to_string().contains("use overwrite"));

    h.backend.ingest([record("k1", at(1, 20), 6, 0)]);
    executor
        .recreate(at(1, 0), at(2, 0), true)
        .await
        .expect("overwrite recreates");

    let rows = h.backend.summaries();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].counters["accountAuctions"], 10);

    // Recreate writes recreate markers, never the stream cursor.
    assert_eq!(h.summary_checkpoint().await, None);
    let marker = freshness_marker("svc-1", "pA", "k1", MarkerKind::Recreated);
    assert!(h.checkpoints.get(&marker).await.expect("get").is_some());
    assert!(h.alerts.is_empty());
}

#[tokio::test]
async fn test_recreate_mode_refuses_populated_window() {
    let h = Harness::new();
    h.backend.ingest([record("k1", at(1, 10), 4, 2)]);
    let executor = h.summary(3);

    executor
        .run_window(at(1, 0), at(2, 0), RunMode::Incremental)
        .await
        .expect("incremental run");
    h.backend.ingest([record("k1", at(1, 20), 6, 0)]);

    let err = executor
        .run_window(at(1, 0), at(2, 0), RunMode::Recreate)
        .await
        .expect_err("populated window conflicts");
    assert!(matches!(err, AggregationError::Conflict { existing: 1 }));

    // The stored row is left as written by the incremental run.
    let rows = h.backend.summaries();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].counters["accountAuctions"], 4);
    assert!(h.alerts.is_empty());
}

#[tokio::test]
async fn test_invalid_window_is_not_alerted() {
    let h = Harness::new();
    let err = h
        .summary(3)
        .recreate(at(2, 0), at(1, 0), false)
        .await
        .expect_err("end before start");

    assert!(err.is_validation());
    assert!(h.alerts.is_empty());
}

#[tokio::test]
async fn test_long_outage_skips_backlog_with_alert() {
    let h = Harness::new();
    h.checkpoints
        .put(SUMMARY_STREAM, at(1, 0))
        .await
        .expect("seed checkpoint");

    let tick = h.summary(3).run_scheduled(at(9, 0)).await;

    let skipped = tick.skipped_range.expect("backlog skipped");
    assert_eq!((skipped.from, skipped.to), (at(1, 0), at(6, 0)));
    assert_eq!(tick.windows.len(), 3);
    assert_eq!(h.summary_checkpoint().await, Some(at(9, 0)));

    let raised = h.alerts.take();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].name, AlertName::SummaryAggregationError);
    assert_eq!(raised[0].severity, Severity::High);
    assert!(raised[0].message.starts_with("Missing summary reports from"));
}

#[tokio::test]
async fn test_write_failure_keeps_checkpoint() {
    let h = Harness::new();
    h.checkpoints
        .put(SUMMARY_STREAM, at(1, 0))
        .await
        .expect("seed checkpoint");
    h.backend.ingest([record("k1", at(1, 10), 1, 1)]);
    h.backend.fail(BackendOp::UpsertSummaries);

    let executor = h.summary(3);
    let tick = executor.run_scheduled(at(3, 0)).await;

    assert!(tick.error.is_some());
    assert_eq!(h.summary_checkpoint().await, Some(at(1, 0)));
    let raised = h.alerts.take();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].name, AlertName::SummaryAggregationError);

    // The next tick retries the same windows.
    h.backend.clear_failures();
    let tick = executor.run_scheduled(at(3, 0)).await;
    assert_eq!(tick.windows.len(), 2);
    assert_eq!(h.summary_checkpoint().await, Some(at(3, 0)));
}

#[tokio::test]
async fn test_startup_grace_defers_first_interval() {
    let h = Harness::new();
    let tick = h.summary(3).run_scheduled(at(0, 30)).await;

    assert!(tick.deferred);
    assert!(tick.windows.is_empty());
    assert_eq!(h.summary_checkpoint().await, None);
}

#[tokio::test]
async fn test_key_filter_restricts_summary() {
    let h = Harness::new();
    h.backend.ingest([record("k1", at(1, 10), 1, 1), record("k2", at(1, 20), 2, 2)]);

    let outcome = h
        .summary(3)
        .run_explicit_window_for(at(1, 0), at(2, 0), &KeyFilter::parse("k2"))
        .await
        .expect("filtered run");

    assert_eq!(outcome.written, 1);
    let rows = h.backend.summaries();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].logical_key, "k2");
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let h = Harness::new();
    let mut bad = record("k1", at(1, 15), 0, 0);
    bad.payload = json!({ "accountAuctions": "many" });
    h.backend.ingest([record("k1", at(1, 10), 1, 1), bad]);

    let outcome = h
        .summary(3)
        .run_explicit_window(at(1, 0), at(2, 0))
        .await
        .expect("run");

    assert_eq!(outcome.written, 1);
    assert_eq!(outcome.skipped, 1);
}

#[tokio::test]
async fn test_spend_stream_refreshes_latest_values() {
    let h = Harness::new();
    let executor = SpendExecutor::new(
        Arc::clone(&h.backend),
        Arc::clone(&h.checkpoints),
        Arc::clone(&h.alerts),
        SpendSettings {
            max_lookback: TimeDelta::hours(1),
            service_instance_id: "svc-1".to_string(),
        },
    );

    h.backend.ingest([record("k1", at(4, 10), 0, 2), record("k1", at(4, 40), 0, 5)]);
    let outcome = executor.run_scheduled(at(5, 0)).await.expect("spend run");
    assert_eq!(outcome.written, 1);

    let latest = h.backend.latest_values();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].summary, json!({ "targetMatched": 7 }));
    assert_eq!(latest[0].service_instance_id, "svc-1");

    let cp = h
        .checkpoints
        .get(SPEND_STREAM)
        .await
        .expect("get")
        .expect("spend checkpoint");
    assert_eq!(cp.value, at(5, 0));

    h.backend.fail(BackendOp::DistinctGroupingKeys);
    assert!(executor.run_scheduled(at(5, 30)).await.is_none());
    let cp = h
        .checkpoints
        .get(SPEND_STREAM)
        .await
        .expect("get")
        .expect("spend checkpoint");
    assert_eq!(cp.value, at(5, 0));
    assert_eq!(h.alerts.take()[0].name, AlertName::SpendAggregationError);
}
