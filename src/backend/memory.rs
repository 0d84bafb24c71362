use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::window::AggregationWindow;

use super::{
    AggregationBackend, CounterSet, GroupingKey, KeyFilter, LatestValueRow, ObservedKey,
    RawRecord, SpendBatch, SummaryBatch, SummaryRow,
};

type SummaryKey = (DateTime<Utc>, DateTime<Utc>, String);
type LatestKey = (String, String, String, String, String);

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Aggregate,
    UpsertSummaries,
    Count,
    Delete,
    DistinctGroupingKeys,
    UpsertLatestValues,
}

/// In-memory aggregation backend over a vector of raw records.
///
/// Summary and latest-value tables are maps keyed by their grouping key, so
/// writes behave as upserts.
pub struct MemoryBackend {
    counters: CounterSet,
    records: RwLock<Vec<RawRecord>>,
    summaries: Mutex<BTreeMap<SummaryKey, SummaryRow>>,
    latest: Mutex<BTreeMap<LatestKey, LatestValueRow>>,
    failing: Mutex<HashSet<BackendOp>>,
    failing_partition: Mutex<Option<GroupingKey>>,
}

impl MemoryBackend {
    pub fn new(counters: CounterSet) -> Self {
        Self {
            counters,
            records: RwLock::new(Vec::new()),
            summaries: Mutex::new(BTreeMap::new()),
            latest: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(HashSet::new()),
            failing_partition: Mutex::new(None),
        }
    }

    /// Appends raw records.
    pub fn ingest(&self, records: impl IntoIterator<Item = RawRecord>) {
        self.records.write().extend(records);
    }

    /// Stored summary rows ordered by (report window, logical key).
    pub fn summaries(&self) -> Vec<SummaryRow> {
        self.summaries.lock().values().cloned().collect()
    }

    /// Stored latest-value rows ordered by their grouping key.
    pub fn latest_values(&self) -> Vec<LatestValueRow> {
        self.latest.lock().values().cloned().collect()
    }

    /// Makes every subsequent call of `op` fail until cleared.
    pub fn fail(&self, op: BackendOp) {
        self.failing.lock().insert(op);
    }

    /// Makes latest-value upserts fail for one partition only.
    pub fn fail_partition(&self, key: GroupingKey) {
        *self.failing_partition.lock() = Some(key);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
        self.failing_partition.lock().take();
    }

    fn check(&self, op: BackendOp) -> Result<()> {
        if self.failing.lock().contains(&op) {
            bail!("injected {op:?} failure");
        }
        Ok(())
    }

    fn summarize(&self, window: &AggregationWindow, filter: Option<&KeyFilter>) -> SummaryBatch {
        let records = self.records.read();
        let names = &self.counters.summary;

        let mut rows: BTreeMap<String, SummaryRow> = BTreeMap::new();
        let mut observed = BTreeSet::new();
        let mut skipped = 0;

        for r in records.iter().filter(|r| window.contains(r.event_time)) {
            if filter.is_some_and(|f| !f.contains(&r.logical_key)) {
                continue;
            }

            if r.logical_key.is_empty() {
                skipped += 1;
                continue;
            }

            let Some(values) = r.counters(names) else {
                skipped += 1;
                continue;
            };

            let row = SummaryRow {
                report_window_start: window.start(),
                report_window_end: window.end(),
                data_window_start: r.data_window_start,
                data_window_end: r.data_window_end,
                logical_key: r.logical_key.clone(),
                ext_key: r.ext_key.clone(),
                producer_code: r.producer_code.clone(),
                counters: names.iter().cloned().zip(values).collect(),
            };

            match rows.get_mut(&r.logical_key) {
                Some(existing) => existing.merge(row),
                None => {
                    rows.insert(r.logical_key.clone(), row);
                }
            }

            observed.insert(ObservedKey {
                producer_code: r.producer_code.clone(),
                logical_key: r.logical_key.clone(),
            });
        }

        SummaryBatch {
            rows: rows.into_values().collect(),
            observed,
            skipped,
        }
    }

    fn matching_summary_keys(&self, window: &AggregationWindow) -> Vec<SummaryKey> {
        self.summaries
            .lock()
            .keys()
            .filter(|(start, end, _)| window.covers(*start, *end))
            .cloned()
            .collect()
    }
}

impl AggregationBackend for MemoryBackend {
    async fn aggregate(
        &self,
        window: &AggregationWindow,
        filter: Option<&KeyFilter>,
    ) -> Result<SummaryBatch> {
        self.check(BackendOp::Aggregate)?;
        Ok(self.summarize(window, filter))
    }

    async fn upsert_summaries(&self, rows: &[SummaryRow]) -> Result<u64> {
        self.check(BackendOp::UpsertSummaries)?;

        let mut table = self.summaries.lock();
        for row in rows {
            let key = (
                row.report_window_start,
                row.report_window_end,
                row.logical_key.clone(),
            );
            table.insert(key, row.clone());
        }

        Ok(rows.len() as u64)
    }

    async fn count(&self, window: &AggregationWindow) -> Result<u64> {
        self.check(BackendOp::Count)?;
        Ok(self.matching_summary_keys(window).len() as u64)
    }

    async fn delete(&self, window: &AggregationWindow) -> Result<u64> {
        self.check(BackendOp::Delete)?;

        let keys = self.matching_summary_keys(window);
        let mut table = self.summaries.lock();
        for key in &keys {
            table.remove(key);
        }

        Ok(keys.len() as u64)
    }

    async fn distinct_grouping_keys(&self, window: &AggregationWindow) -> Result<Vec<GroupingKey>> {
        self.check(BackendOp::DistinctGroupingKeys)?;

        let keys: BTreeSet<GroupingKey> = self
            .records
            .read()
            .iter()
            .filter(|r| window.contains(r.event_time))
            .filter(|r| !r.vendor.is_empty() && !r.region.is_empty())
            .map(|r| GroupingKey {
                vendor: r.vendor.clone(),
                region: r.region.clone(),
            })
            .collect();

        Ok(keys.into_iter().collect())
    }

    async fn upsert_latest_values(
        &self,
        window: &AggregationWindow,
        key: &GroupingKey,
        service_instance_id: &str,
    ) -> Result<SpendBatch> {
        self.check(BackendOp::UpsertLatestValues)?;
        if self.failing_partition.lock().as_ref() == Some(key) {
            bail!("injected failure for {}/{}", key.vendor, key.region);
        }

        let counter = std::slice::from_ref(&self.counters.spend);
        let mut grouped: BTreeMap<LatestKey, (LatestValueRow, i64)> = BTreeMap::new();
        let mut skipped = 0;

        for r in self.records.read().iter() {
            if !window.contains(r.event_time) || r.vendor != key.vendor || r.region != key.region {
                continue;
            }

            if !r.has_spend_keys() {
                skipped += 1;
                continue;
            }

            let Some(value) = r.counters(counter).and_then(|v| v.first().copied()) else {
                skipped += 1;
                continue;
            };

            let k = (
                r.vendor.clone(),
                r.region.clone(),
                r.instance_id.clone(),
                r.producer_code.clone(),
                r.logical_key.clone(),
            );

            match grouped.get_mut(&k) {
                Some((row, sum)) => {
                    *sum += value;
                    row.data_window_start = row.data_window_start.min(r.data_window_start);
                    row.data_window_end = row.data_window_end.max(r.data_window_end);
                    row.report_timestamp = row.report_timestamp.max(r.event_time);
                    if r.ext_key < row.ext_key {
                        row.ext_key = r.ext_key.clone();
                    }
                }
                None => {
                    let row = LatestValueRow {
                        vendor: r.vendor.clone(),
                        region: r.region.clone(),
                        instance_id: r.instance_id.clone(),
                        producer_code: r.producer_code.clone(),
                        logical_key: r.logical_key.clone(),
                        ext_key: r.ext_key.clone(),
                        data_window_start: r.data_window_start,
                        data_window_end: r.data_window_end,
                        report_timestamp: r.event_time,
                        service_instance_id: service_instance_id.to_string(),
                        summary: serde_json::Value::Null,
                    };
                    grouped.insert(k, (row, value));
                }
            }
        }

        let written = grouped.len() as u64;
        let mut table = self.latest.lock();
        for (k, (mut row, sum)) in grouped {
            let mut summary = serde_json::Map::new();
            summary.insert(self.counters.spend.clone(), sum.into());
            row.summary = serde_json::Value::Object(summary);
            table.insert(k, row);
        }

        Ok(SpendBatch { written, skipped })
    }
}
