pub mod health;

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Manages the ClickHouse native TCP connection pool shared by the backend,
/// the checkpoint store and the migrator.
pub struct ClickHouseConnection {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
}

impl ClickHouseConnection {
    /// Creates a new connection manager with the given configuration.
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn start(&mut self) -> Result<()> {
        let dsn = self.build_dsn();
        let pool = Pool::new(dsn);

        let mut handle = with_timeout(
            self.cfg.query_timeout,
            "opening ClickHouse connection",
            pool.get_handle(),
        )
        .await?;

        with_timeout(self.cfg.query_timeout, "pinging ClickHouse", handle.ping()).await?;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse connected",
        );

        self.pool = Some(pool);

        Ok(())
    }

    /// Returns the connection pool, if started.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Returns the connection pool or an error when not started.
    pub fn require_pool(&self) -> Result<Pool> {
        self.pool
            .clone()
            .context("ClickHouse connection has not been started")
    }

    /// Closes the connection pool.
    pub async fn stop(&mut self) -> Result<()> {
        self.pool.take();
        Ok(())
    }

    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    fn build_dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}

/// Runs a ClickHouse call under the configured query timeout.
///
/// An elapsed timeout is reported like any other storage error.
pub async fn with_timeout<T, E, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.with_context(|| what.to_string()),
        Err(_) => anyhow::bail!("{what}: timed out after {timeout:?}"),
    }
}

// --- SQL formatting helpers ---

/// Formats an instant as a ClickHouse DateTime64(3) literal.
pub fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
pub fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Formats strings as a ClickHouse array literal.
pub fn format_string_array(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", escape_sql(v)))
        .collect();

    format!("[{}]", quoted.join(", "))
}

/// Converts a `toUnixTimestamp64Milli` column value into an instant.
pub fn instant_from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("timestamp {ms}ms out of range"))
}
