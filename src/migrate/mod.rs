use std::time::Duration;

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;
use serde::Serialize;
use tracing::info;

use crate::export::with_timeout;

/// Embedded schema migration.
struct Migration {
    version: u32,
    name: &'static str,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// Ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        name: "summary_key_index",
        up_sql: include_str!("sql/002_summary_key_index.up.sql"),
        down_sql: include_str!("sql/002_summary_key_index.down.sql"),
    },
];

/// Applied schema version as recorded in `schema_migrations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchemaVersion {
    pub version: u32,
    pub dirty: bool,
    pub latest: u32,
}

impl SchemaVersion {
    pub fn is_current(&self) -> bool {
        !self.dirty && self.version == self.latest
    }
}

/// Highest embedded migration version.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Versioned schema management for the raw record, summary, latest value
/// and checkpoint tables.
pub trait Migrator: Send {
    /// Applies every pending migration.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the most recently applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn status(&self) -> impl std::future::Future<Output = Result<SchemaVersion>> + Send;
}

pub struct ClickHouseMigrator {
    pool: Pool,
    timeout: Duration,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut handle = with_timeout(
            self.timeout,
            "getting ClickHouse handle for migration",
            self.pool.get_handle(),
        )
        .await?;

        with_timeout(self.timeout, "executing migration statement", handle.execute(sql))
            .await
            .with_context(|| {
                let preview: String = sql.chars().take(80).collect();
                format!("statement: {preview}")
            })
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        self.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version Int64,
                dirty UInt8,
                sequence UInt64
            ) ENGINE = TinyLog",
        )
        .await
        .context("creating schema_migrations table")
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = with_timeout(
            self.timeout,
            "getting ClickHouse handle for version check",
            self.pool.get_handle(),
        )
        .await?;

        let block = with_timeout(
            self.timeout,
            "querying migration version",
            handle
                .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
                .fetch_all(),
        )
        .await?;

        match block.rows().next() {
            Some(row) => {
                let version: i64 = row.get("version").context("reading version")?;
                let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
                let version = u32::try_from(version)
                    .with_context(|| format!("invalid schema version {version}"))?;
                Ok((version, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        self.execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        self.execute(&version_insert_sql(version, dirty))
            .await
            .context("recording migration version")
    }

    async fn execute_script(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            self.execute(statement).await?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current, dirty) = self.current_version().await?;
        if dirty {
            bail!("schema version {current} is dirty, manual intervention required");
        }

        let pending = pending_after(current);
        if pending.is_empty() {
            info!(version = current, "schema is up to date");
            return Ok(());
        }

        for migration in &pending {
            info!(version = migration.version, name = migration.name, "applying migration");

            self.set_version(migration.version, true).await?;
            self.execute_script(migration.up_sql)
                .await
                .with_context(|| format!("applying migration {}", migration.version))?;
            self.set_version(migration.version, false).await?;
        }

        info!(
            from = current,
            to = latest_version(),
            applied = pending.len(),
            "migrations applied",
        );

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current, _) = self.current_version().await?;
        if current == 0 {
            info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("migration version {current} not found"))?;

        info!(version = current, name = migration.name, "rolling back migration");

        self.set_version(current, true).await?;
        self.execute_script(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration {current}"))?;

        let previous = previous_version(current);
        self.set_version(previous, false).await?;

        info!(version = previous, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<SchemaVersion> {
        self.ensure_migrations_table().await?;
        let (version, dirty) = self.current_version().await?;

        Ok(SchemaVersion {
            version,
            dirty,
            latest: latest_version(),
        })
    }
}

fn pending_after(current: u32) -> Vec<&'static Migration> {
    MIGRATIONS.iter().filter(|m| m.version > current).collect()
}

fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .filter(|m| m.version < current)
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

fn version_insert_sql(version: u32, dirty: bool) -> String {
    format!(
        "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
        u8::from(dirty)
    )
}

/// Splits a script on `;`, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let stmts = split_statements("CREATE TABLE a (x Int32);\n\n  DROP TABLE b;;;");
        assert_eq!(stmts, vec!["CREATE TABLE a (x Int32)", "DROP TABLE b"]);
        assert!(split_statements("  \n").is_empty());
    }

    #[test]
    fn test_migrations_ordered_and_non_empty() {
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!split_statements(m.up_sql).is_empty(), "{} up is empty", m.version);
            assert!(!split_statements(m.down_sql).is_empty(), "{} down is empty", m.version);
        }

        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_init_creates_every_table() {
        let init = MIGRATIONS[0].up_sql;
        for table in ["telemetry_records", "window_summaries", "latest_values", "checkpoints"] {
            assert!(
                init.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing {table}"
            );
        }
        assert!(init.contains("ReplacingMergeTree(updated_at)"));
    }

    #[test]
    fn test_pending_and_previous() {
        assert_eq!(pending_after(0).len(), MIGRATIONS.len());
        assert!(pending_after(latest_version()).is_empty());
        assert_eq!(previous_version(2), 1);
        assert_eq!(previous_version(1), 0);
    }

    #[test]
    fn test_version_insert_sql() {
        assert_eq!(
            version_insert_sql(2, true),
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES (2, 1, 1)"
        );
    }

    #[test]
    fn test_schema_version_is_current() {
        let v = SchemaVersion {
            version: latest_version(),
            dirty: false,
            latest: latest_version(),
        };
        assert!(v.is_current());
        assert!(!SchemaVersion { dirty: true, ..v }.is_current());
    }
}
