use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::export::{escape_sql, format_datetime, instant_from_millis, with_timeout};

use super::{format_instant, parse_instant, Checkpoint, CheckpointStore};

/// Checkpoint store over the `checkpoints` ReplacingMergeTree table.
///
/// Rows are versioned by `updated_at`; reads use `FINAL` so the latest write
/// per name wins.
#[derive(Clone)]
pub struct ClickHouseCheckpointStore {
    pool: Pool,
    database: String,
    timeout: Duration,
}

impl ClickHouseCheckpointStore {
    pub fn new(pool: Pool, database: String, timeout: Duration) -> Self {
        Self {
            pool,
            database,
            timeout,
        }
    }

    fn table(&self) -> String {
        format!("{}.checkpoints", self.database)
    }

    async fn select(&self, sql: String) -> Result<Vec<Checkpoint>> {
        let mut handle =
            with_timeout(self.timeout, "getting handle for checkpoint read", self.pool.get_handle())
                .await?;

        let block = with_timeout(
            self.timeout,
            "querying checkpoints",
            handle.query(sql.as_str()).fetch_all(),
        )
        .await?;

        let mut out = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let name: String = row.get("name").context("reading checkpoint name")?;
            let value: String = row.get("value").context("reading checkpoint value")?;
            let updated_ms: i64 = row.get("updated_ms").context("reading checkpoint updated_at")?;

            let value = parse_instant(&value)
                .with_context(|| format!("parsing value of checkpoint {name}"))?;

            out.push(Checkpoint {
                name,
                value,
                updated_at: instant_from_millis(updated_ms)?,
            });
        }

        Ok(out)
    }
}

impl CheckpointStore for ClickHouseCheckpointStore {
    async fn get(&self, name: &str) -> Result<Option<Checkpoint>> {
        let sql = get_sql(&self.table(), name);
        let mut rows = self.select(sql).await?;
        Ok(rows.pop())
    }

    async fn put(&self, name: &str, value: DateTime<Utc>) -> Result<()> {
        let sql = put_sql(&self.table(), name, value, Utc::now());

        let mut handle = with_timeout(
            self.timeout,
            "getting handle for checkpoint write",
            self.pool.get_handle(),
        )
        .await?;

        with_timeout(
            self.timeout,
            &format!("writing checkpoint {name}"),
            handle.execute(sql.as_str()),
        )
        .await
    }

    async fn list_by_pattern(
        &self,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Checkpoint>> {
        self.select(list_sql(&self.table(), pattern, since)).await
    }
}

const READ_COLUMNS: &str = "name, value, toUnixTimestamp64Milli(updated_at) AS updated_ms";

fn get_sql(table: &str, name: &str) -> String {
    format!(
        "SELECT {READ_COLUMNS} FROM {table} FINAL WHERE name = '{}' LIMIT 1",
        escape_sql(name)
    )
}

fn put_sql(table: &str, name: &str, value: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format!(
        "INSERT INTO {table} (name, value, updated_at) VALUES ('{}', '{}', {})",
        escape_sql(name),
        format_instant(value),
        format_datetime(now),
    )
}

fn list_sql(table: &str, pattern: &str, since: DateTime<Utc>) -> String {
    format!(
        "SELECT {READ_COLUMNS} FROM {table} FINAL \
         WHERE name LIKE '{}' AND updated_at >= {} \
         ORDER BY updated_at DESC",
        escape_like(pattern),
        format_datetime(since),
    )
}

/// Escapes a `LIKE` pattern so only `%` acts as a wildcard.
fn escape_like(pattern: &str) -> String {
    escape_sql(pattern).replace('_', "\\\\_")
}
