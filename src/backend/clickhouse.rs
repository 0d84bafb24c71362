use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::types::{Block, Complex};
use clickhouse_rs::Pool;

use crate::export::{
    escape_sql, format_datetime, format_string_array, instant_from_millis, with_timeout,
};
use crate::window::AggregationWindow;

use super::{
    AggregationBackend, CounterSet, GroupingKey, KeyFilter, ObservedKey, SpendBatch,
    SummaryBatch, SummaryRow,
};

/// Aggregation backend delegating summation to ClickHouse.
///
/// Counters are extracted from the JSON `payload` column with `JSONExtractInt`.
/// Summary and latest-value tables are ReplacingMergeTrees, so inserting a row
/// with an existing sorting key replaces it.
#[derive(Clone)]
pub struct ClickHouseBackend {
    pool: Pool,
    database: String,
    counters: CounterSet,
    timeout: Duration,
}

impl ClickHouseBackend {
    pub fn new(pool: Pool, database: String, counters: CounterSet, timeout: Duration) -> Self {
        Self {
            pool,
            database,
            counters,
            timeout,
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{name}", self.database)
    }

    async fn fetch(&self, sql: &str, what: &str) -> Result<Block<Complex>> {
        let mut handle = with_timeout(
            self.timeout,
            &format!("getting handle for {what}"),
            self.pool.get_handle(),
        )
        .await?;

        with_timeout(self.timeout, what, handle.query(sql).fetch_all()).await
    }

    async fn execute(&self, sql: &str, what: &str) -> Result<()> {
        let mut handle = with_timeout(
            self.timeout,
            &format!("getting handle for {what}"),
            self.pool.get_handle(),
        )
        .await?;

        with_timeout(self.timeout, what, handle.execute(sql)).await
    }

    async fn fetch_u64(&self, sql: &str, column: &str, what: &str) -> Result<u64> {
        let block = self.fetch(sql, what).await?;
        match block.rows().next() {
            Some(row) => row
                .get::<u64, _>(column)
                .with_context(|| format!("reading {column}")),
            None => Ok(0),
        }
    }
}

impl AggregationBackend for ClickHouseBackend {
    async fn aggregate(
        &self,
        window: &AggregationWindow,
        filter: Option<&KeyFilter>,
    ) -> Result<SummaryBatch> {
        let source = self.table("telemetry_records");
        let names = &self.counters.summary;

        let sql = aggregate_sql(&source, window, filter, names);
        let block = self.fetch(&sql, "aggregating summaries").await?;

        let mut rows: BTreeMap<String, SummaryRow> = BTreeMap::new();
        let mut observed = BTreeSet::new();

        for r in block.rows() {
            let logical_key: String = r.get("logical_key").context("reading logical_key")?;
            let producer_code: String = r.get("producer_code").context("reading producer_code")?;
            let ext_key: String = r.get("ext_key").context("reading ext_key")?;
            let dws: i64 = r.get("dws_ms").context("reading data window start")?;
            let dwe: i64 = r.get("dwe_ms").context("reading data window end")?;

            let mut counters = BTreeMap::new();
            for (idx, name) in names.iter().enumerate() {
                let value: i64 = r
                    .get(format!("c{idx}").as_str())
                    .with_context(|| format!("reading counter {name}"))?;
                counters.insert(name.clone(), value);
            }

            let row = SummaryRow {
                report_window_start: window.start(),
                report_window_end: window.end(),
                data_window_start: instant_from_millis(dws)?,
                data_window_end: instant_from_millis(dwe)?,
                logical_key: logical_key.clone(),
                ext_key,
                producer_code: producer_code.clone(),
                counters,
            };

            match rows.get_mut(&logical_key) {
                Some(existing) => existing.merge(row),
                None => {
                    rows.insert(logical_key.clone(), row);
                }
            }

            observed.insert(ObservedKey {
                producer_code,
                logical_key,
            });
        }

        let skipped_sql = skipped_sql(&source, window, filter, names);
        let skipped = self
            .fetch_u64(&skipped_sql, "skipped", "counting malformed records")
            .await?;

        Ok(SummaryBatch {
            rows: rows.into_values().collect(),
            observed,
            skipped,
        })
    }

    async fn upsert_summaries(&self, rows: &[SummaryRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = insert_summaries_sql(&self.table("window_summaries"), rows, Utc::now());
        self.execute(&sql, "writing window summaries").await?;

        Ok(rows.len() as u64)
    }

    async fn count(&self, window: &AggregationWindow) -> Result<u64> {
        let sql = format!(
            "SELECT count() AS n FROM {} FINAL WHERE {}",
            self.table("window_summaries"),
            report_window_clause(window),
        );

        self.fetch_u64(&sql, "n", "counting window summaries").await
    }

    async fn delete(&self, window: &AggregationWindow) -> Result<u64> {
        let existing = self.count(window).await?;
        if existing == 0 {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.table("window_summaries"),
            report_window_clause(window),
        );
        self.execute(&sql, "deleting window summaries").await?;

        Ok(existing)
    }

    async fn distinct_grouping_keys(&self, window: &AggregationWindow) -> Result<Vec<GroupingKey>> {
        let sql = format!(
            "SELECT DISTINCT vendor, region FROM {} \
             WHERE {} AND vendor != '' AND region != '' \
             ORDER BY vendor, region",
            self.table("telemetry_records"),
            event_time_clause(window),
        );

        let block = self.fetch(&sql, "listing vendor/region partitions").await?;

        let mut keys = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            keys.push(GroupingKey {
                vendor: row.get("vendor").context("reading vendor")?,
                region: row.get("region").context("reading region")?,
            });
        }

        Ok(keys)
    }

    async fn upsert_latest_values(
        &self,
        window: &AggregationWindow,
        key: &GroupingKey,
        service_instance_id: &str,
    ) -> Result<SpendBatch> {
        let source = self.table("telemetry_records");

        let stats_sql = latest_stats_sql(&source, window, key, &self.counters.spend);

        let block = self
            .fetch(&stats_sql, "counting latest-value partition")
            .await?;
        let (written, skipped) = match block.rows().next() {
            Some(row) => (
                row.get::<u64, _>("written").context("reading written")?,
                row.get::<u64, _>("skipped").context("reading skipped")?,
            ),
            None => (0, 0),
        };

        if written > 0 {
            let sql = upsert_latest_sql(
                &self.table("latest_values"),
                &source,
                window,
                key,
                service_instance_id,
                &self.counters.spend,
                Utc::now(),
            );
            self.execute(
                &sql,
                &format!("writing latest values for {}/{}", key.vendor, key.region),
            )
            .await?;
        }

        Ok(SpendBatch { written, skipped })
    }
}

/// Predicate accepting records that can be rolled into latest-value rows.
fn valid_spend_predicate(counter: &str) -> String {
    format!(
        "instance_id != '' AND producer_code != '' AND {}",
        valid_record_predicate(std::slice::from_ref(&counter.to_string()))
    )
}

fn event_time_clause(window: &AggregationWindow) -> String {
    format!(
        "event_time >= {} AND event_time < {}",
        format_datetime(window.start()),
        format_datetime(window.end()),
    )
}

fn report_window_clause(window: &AggregationWindow) -> String {
    format!(
        "report_window_start >= {} AND report_window_end <= {}",
        format_datetime(window.start()),
        format_datetime(window.end()),
    )
}

fn partition_clause(window: &AggregationWindow, key: &GroupingKey) -> String {
    format!(
        "{} AND vendor = '{}' AND region = '{}'",
        event_time_clause(window),
        escape_sql(&key.vendor),
        escape_sql(&key.region),
    )
}

/// Predicate accepting records that can be summarized.
fn valid_record_predicate(counters: &[String]) -> String {
    let mut pred = "logical_key != '' AND isValidJSON(payload) AND JSONType(payload) = 'Object'"
        .to_string();

    for name in counters {
        let _ = write!(
            pred,
            " AND JSONType(payload, '{}') IN ('Null', 'Int64', 'UInt64')",
            escape_sql(name)
        );
    }

    pred
}

fn key_filter_clause(filter: Option<&KeyFilter>) -> String {
    match filter {
        Some(f) => {
            let keys: Vec<String> = f.keys().map(str::to_string).collect();
            format!(" AND has({}, logical_key)", format_string_array(&keys))
        }
        None => String::new(),
    }
}

fn aggregate_sql(
    source: &str,
    window: &AggregationWindow,
    filter: Option<&KeyFilter>,
    counters: &[String],
) -> String {
    let mut sql = String::with_capacity(512 + counters.len() * 64);
    sql.push_str(
        "SELECT logical_key, producer_code, min(ext_key) AS ext_key, \
         toUnixTimestamp64Milli(min(data_window_start)) AS dws_ms, \
         toUnixTimestamp64Milli(max(data_window_end)) AS dwe_ms",
    );

    for (idx, name) in counters.iter().enumerate() {
        let _ = write!(
            sql,
            ", sum(JSONExtractInt(payload, '{}')) AS c{idx}",
            escape_sql(name)
        );
    }

    let _ = write!(
        sql,
        " FROM {source} WHERE {} AND {}{} GROUP BY logical_key, producer_code",
        event_time_clause(window),
        valid_record_predicate(counters),
        key_filter_clause(filter),
    );

    sql
}

fn skipped_sql(
    source: &str,
    window: &AggregationWindow,
    filter: Option<&KeyFilter>,
    counters: &[String],
) -> String {
    format!(
        "SELECT countIf(NOT ({})) AS skipped FROM {source} WHERE {}{}",
        valid_record_predicate(counters),
        event_time_clause(window),
        key_filter_clause(filter),
    )
}

fn format_counter_map(counters: &BTreeMap<String, i64>) -> String {
    let mut out = String::from("map(");
    for (idx, (name, value)) in counters.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "'{}', {value}", escape_sql(name));
    }
    out.push(')');
    out
}

fn insert_summaries_sql(table: &str, rows: &[SummaryRow], now: DateTime<Utc>) -> String {
    let updated = format_datetime(now);
    let mut sql = String::with_capacity(256 + rows.len() * 256);
    let _ = write!(
        sql,
        "INSERT INTO {table} (report_window_start, report_window_end, data_window_start, \
         data_window_end, logical_key, ext_key, producer_code, counters, updated_at) VALUES "
    );

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "({}, {}, {}, {}, '{}', '{}', '{}', {}, {updated})",
            format_datetime(row.report_window_start),
            format_datetime(row.report_window_end),
            format_datetime(row.data_window_start),
            format_datetime(row.data_window_end),
            escape_sql(&row.logical_key),
            escape_sql(&row.ext_key),
            escape_sql(&row.producer_code),
            format_counter_map(&row.counters),
        );
    }

    sql
}

fn latest_stats_sql(
    source: &str,
    window: &AggregationWindow,
    key: &GroupingKey,
    counter: &str,
) -> String {
    format!(
        "SELECT \
         uniqExactIf((instance_id, producer_code, logical_key), {valid}) AS written, \
         countIf(NOT ({valid})) AS skipped \
         FROM {source} WHERE {partition}",
        valid = valid_spend_predicate(counter),
        partition = partition_clause(window, key),
    )
}

fn upsert_latest_sql(
    table: &str,
    source: &str,
    window: &AggregationWindow,
    key: &GroupingKey,
    service_instance_id: &str,
    counter: &str,
    now: DateTime<Utc>,
) -> String {
    let valid = valid_spend_predicate(counter);
    let counter = escape_sql(counter);
    format!(
        "INSERT INTO {table} (vendor, region, instance_id, producer_code, logical_key, ext_key, \
         data_window_start, data_window_end, report_timestamp, service_instance_id, summary, \
         updated_at) \
         SELECT vendor, region, instance_id, producer_code, logical_key, min(ext_key), \
         min(data_window_start), max(data_window_end), max(event_time), '{}', \
         toJSONString(map('{counter}', sum(JSONExtractInt(payload, '{counter}')))), {} \
         FROM {source} WHERE {} AND {valid} \
         GROUP BY vendor, region, instance_id, producer_code, logical_key",
        escape_sql(service_instance_id),
        format_datetime(now),
        partition_clause(window, key),
    )
}
