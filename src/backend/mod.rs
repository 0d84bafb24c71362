pub mod clickhouse;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::window::AggregationWindow;

/// Counters summed out of each record's JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSet {
    /// Counters rolled into summary rows.
    pub summary: Vec<String>,
    /// Counter rolled into latest-value rows.
    pub spend: String,
}

/// Raw telemetry record as persisted by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub instance_id: String,
    pub producer_code: String,
    pub logical_key: String,
    pub ext_key: String,
    pub vendor: String,
    pub region: String,
    pub event_time: DateTime<Utc>,
    pub data_window_start: DateTime<Utc>,
    pub data_window_end: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl RawRecord {
    /// Extracts the named counters from the payload.
    ///
    /// Returns `None` when the payload is not an object or a present counter is
    /// not an integer. Absent counters count as zero.
    pub fn counters(&self, names: &[String]) -> Option<Vec<i64>> {
        let obj = self.payload.as_object()?;

        names
            .iter()
            .map(|name| match obj.get(name) {
                None | Some(serde_json::Value::Null) => Some(0),
                Some(v) => v.as_i64(),
            })
            .collect()
    }

    /// Returns true when every field keying a latest-value row is present.
    pub fn has_spend_keys(&self) -> bool {
        !(self.vendor.is_empty()
            || self.region.is_empty()
            || self.instance_id.is_empty()
            || self.producer_code.is_empty()
            || self.logical_key.is_empty())
    }
}

/// Aggregated counts for one logical key over one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRow {
    pub report_window_start: DateTime<Utc>,
    pub report_window_end: DateTime<Utc>,
    pub data_window_start: DateTime<Utc>,
    pub data_window_end: DateTime<Utc>,
    pub logical_key: String,
    pub ext_key: String,
    pub producer_code: String,
    pub counters: BTreeMap<String, i64>,
}

impl SummaryRow {
    /// Merges another group of the same logical key into this row.
    pub fn merge(&mut self, other: SummaryRow) {
        self.data_window_start = self.data_window_start.min(other.data_window_start);
        self.data_window_end = self.data_window_end.max(other.data_window_end);

        if other.ext_key < self.ext_key {
            self.ext_key = other.ext_key;
        }
        if other.producer_code < self.producer_code {
            self.producer_code = other.producer_code;
        }

        for (name, value) in other.counters {
            *self.counters.entry(name).or_insert(0) += value;
        }
    }
}

/// Producer and logical key seen in a window; one freshness marker each.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservedKey {
    pub producer_code: String,
    pub logical_key: String,
}

/// Result of aggregating one window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryBatch {
    pub rows: Vec<SummaryRow>,
    pub observed: BTreeSet<ObservedKey>,
    /// Records excluded for missing or malformed fields.
    pub skipped: u64,
}

/// Spend grouping partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GroupingKey {
    pub vendor: String,
    pub region: String,
}

/// Latest spend snapshot for one (vendor, region, instance, producer, key).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestValueRow {
    pub vendor: String,
    pub region: String,
    pub instance_id: String,
    pub producer_code: String,
    pub logical_key: String,
    pub ext_key: String,
    pub data_window_start: DateTime<Utc>,
    pub data_window_end: DateTime<Utc>,
    pub report_timestamp: DateTime<Utc>,
    pub service_instance_id: String,
    pub summary: serde_json::Value,
}

/// Result of upserting one spend partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpendBatch {
    pub written: u64,
    pub skipped: u64,
}

/// Restricts aggregation to a set of logical keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    keys: BTreeSet<String>,
}

impl KeyFilter {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::<String>::into)
                .filter(|k| !k.trim().is_empty())
                .collect(),
        }
    }

    /// Parses a comma separated key list.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(',').map(str::trim))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Storage substrate computing and persisting aggregates.
///
/// Writes are idempotent upserts keyed by the full grouping key, so repeated
/// or concurrent runs over the same window converge to the same rows.
pub trait AggregationBackend: Send + Sync {
    /// Computes summary rows for records whose event time falls in `window`.
    fn aggregate(
        &self,
        window: &AggregationWindow,
        filter: Option<&KeyFilter>,
    ) -> impl std::future::Future<Output = Result<SummaryBatch>> + Send;

    /// Upserts summary rows keyed by (report window, logical key).
    fn upsert_summaries(
        &self,
        rows: &[SummaryRow],
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Counts summary rows whose report window lies inside `window`.
    fn count(
        &self,
        window: &AggregationWindow,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Deletes summary rows whose report window lies inside `window`.
    fn delete(
        &self,
        window: &AggregationWindow,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Lists the (vendor, region) partitions with records in `window`.
    fn distinct_grouping_keys(
        &self,
        window: &AggregationWindow,
    ) -> impl std::future::Future<Output = Result<Vec<GroupingKey>>> + Send;

    /// Upserts latest-value rows for one partition from records in `window`.
    fn upsert_latest_values(
        &self,
        window: &AggregationWindow,
        key: &GroupingKey,
        service_instance_id: &str,
    ) -> impl std::future::Future<Output = Result<SpendBatch>> + Send;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(payload: serde_json::Value) -> RawRecord {
        let t = DateTime::UNIX_EPOCH;
        RawRecord {
            instance_id: "i-1".to_string(),
            producer_code: "pA".to_string(),
            logical_key: "k1".to_string(),
            ext_key: "ext-k1".to_string(),
            vendor: "v".to_string(),
            region: "r".to_string(),
            event_time: t,
            data_window_start: t,
            data_window_end: t,
            payload,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_counters_extraction() {
        let r = record(json!({"a": 3, "b": null}));
        assert_eq!(r.counters(&names(&["a", "b", "c"])), Some(vec![3, 0, 0]));
    }

    #[test]
    fn test_counters_reject_malformed() {
        assert_eq!(record(json!({"a": "3"})).counters(&names(&["a"])), None);
        assert_eq!(record(json!({"a": 1.5})).counters(&names(&["a"])), None);
        assert_eq!(record(json!([1, 2])).counters(&names(&["a"])), None);
    }

    #[test]
    fn test_has_spend_keys() {
        let mut r = record(json!({}));
        assert!(r.has_spend_keys());
        r.region.clear();
        assert!(!r.has_spend_keys());
    }

    #[test]
    fn test_summary_row_merge() {
        let t0 = DateTime::UNIX_EPOCH;
        let t1 = t0 + chrono::TimeDelta::minutes(5);
        let t2 = t0 + chrono::TimeDelta::minutes(10);

        let mut row = SummaryRow {
            report_window_start: t0,
            report_window_end: t2,
            data_window_start: t1,
            data_window_end: t1,
            logical_key: "k".to_string(),
            ext_key: "x2".to_string(),
            producer_code: "pB".to_string(),
            counters: BTreeMap::from([("a".to_string(), 2)]),
        };

        row.merge(SummaryRow {
            data_window_start: t0,
            data_window_end: t2,
            ext_key: "x1".to_string(),
            producer_code: "pA".to_string(),
            counters: BTreeMap::from([("a".to_string(), 3), ("b".to_string(), 1)]),
            ..row.clone()
        });

        assert_eq!(row.data_window_start, t0);
        assert_eq!(row.data_window_end, t2);
        assert_eq!(row.ext_key, "x1");
        assert_eq!(row.producer_code, "pA");
        assert_eq!(row.counters["a"], 5);
        assert_eq!(row.counters["b"], 1);
    }

    #[test]
    fn test_key_filter_parse() {
        let filter = KeyFilter::parse("k1, k2,,k1 ");
        assert_eq!(filter.len(), 2);
        assert!(filter.contains("k1"));
        assert!(filter.contains("k2"));
        assert!(!filter.contains("k3"));
        assert!(KeyFilter::parse(" , ").is_empty());
    }
}
