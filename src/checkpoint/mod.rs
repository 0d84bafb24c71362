pub mod clickhouse;

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Cursor name of the summary stream.
pub const SUMMARY_STREAM: &str = "summary_interval_end";

/// Cursor name of the spend stream.
pub const SPEND_STREAM: &str = "spend_interval_end";

/// Durable cursor row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub name: String,
    pub value: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable key to instant store, one row per cursor name.
///
/// Writes are last-write-wins upserts. No transaction spans multiple names.
pub trait CheckpointStore: Send + Sync {
    /// Reads a cursor, `None` when it has never been written.
    fn get(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>>> + Send;

    /// Upserts a cursor value, stamping it with the current time.
    fn put(
        &self,
        name: &str,
        value: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Lists cursors whose name matches a SQL `LIKE` pattern (`%` wildcard only)
    /// and that were updated at or after `since`, most recently updated first.
    fn list_by_pattern(
        &self,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>>> + Send;
}

/// Kind of per-key freshness marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Written by incremental runs; watched by the freshness monitor.
    Fresh,
    /// Written by explicit and recreate runs; never watched.
    Recreated,
}

impl MarkerKind {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Fresh => "summary_window_end",
            Self::Recreated => "summary_recreate_window_end",
        }
    }

    /// `LIKE` pattern matching every marker of this kind.
    pub fn pattern(self) -> String {
        format!("%-{}", self.suffix())
    }
}

/// Builds the freshness marker name for one producer/key pair.
pub fn freshness_marker(
    service_instance_id: &str,
    producer_code: &str,
    logical_key: &str,
    kind: MarkerKind,
) -> String {
    format!(
        "{service_instance_id}-{producer_code}-{logical_key}-{}",
        kind.suffix()
    )
}

/// Components of a freshness marker name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerRef {
    pub service_instance_id: String,
    pub producer_code: String,
    pub logical_key: String,
}

impl MarkerRef {
    /// Splits a marker name of the given kind.
    ///
    /// The service instance id may itself contain dashes, so the producer and
    /// key are taken from the right.
    pub fn parse(name: &str, kind: MarkerKind) -> Option<Self> {
        let stem = name.strip_suffix(kind.suffix())?.strip_suffix('-')?;
        let mut parts = stem.rsplitn(3, '-');
        let logical_key = parts.next()?;
        let producer_code = parts.next()?;
        let service_instance_id = parts.next()?;

        if service_instance_id.is_empty() || producer_code.is_empty() || logical_key.is_empty() {
            return None;
        }

        Some(Self {
            service_instance_id: service_instance_id.to_string(),
            producer_code: producer_code.to_string(),
            logical_key: logical_key.to_string(),
        })
    }
}

/// Parses a stored checkpoint value.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` and `YYYY-MM-DDTHH:MM:SS[.fff]`
/// taken as UTC, and a bare `YYYY-MM-DD` taken as midnight UTC.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    let s = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }

    bail!("unrecognised instant {raw:?}")
}

/// Formats an instant the way checkpoint values are stored.
pub fn format_instant(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Matches `name` against a `LIKE` pattern where `%` is the only wildcard.
fn like_match(pattern: &str, name: &str) -> bool {
    let mut pieces = pattern.split('%');
    let Some(first) = pieces.next() else {
        return name.is_empty();
    };

    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };

    let pieces: Vec<&str> = pieces.collect();
    let Some((last, middle)) = pieces.split_last() else {
        // No wildcard: exact match.
        return rest.is_empty();
    };

    for piece in middle {
        match rest.find(piece) {
            Some(idx) => rest = &rest[idx + piece.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    rows: Mutex<BTreeMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a cursor with an explicit update time.
    pub fn put_at(&self, name: &str, value: DateTime<Utc>, updated_at: DateTime<Utc>) {
        self.rows.lock().insert(
            name.to_string(),
            Checkpoint {
                name: name.to_string(),
                value,
                updated_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, name: &str) -> Result<Option<Checkpoint>> {
        Ok(self.rows.lock().get(name).cloned())
    }

    async fn put(&self, name: &str, value: DateTime<Utc>) -> Result<()> {
        self.put_at(name, value, Utc::now());
        Ok(())
    }

    async fn list_by_pattern(
        &self,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Checkpoint>> {
        let mut out: Vec<Checkpoint> = self
            .rows
            .lock()
            .values()
            .filter(|cp| cp.updated_at >= since && like_match(pattern, &cp.name))
            .cloned()
            .collect();

        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(out)
    }
}
