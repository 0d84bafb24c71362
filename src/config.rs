use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use crate::aggregate::spend::SpendSettings;
use crate::aggregate::summary::SummarySettings;
use crate::backend::CounterSet;
use crate::freshness::FreshnessSettings;
use crate::window::planner::PlannerConfig;

/// Top-level configuration for the windowfold service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this process in freshness markers and latest-value rows.
    /// Default: a random UUID generated at load.
    #[serde(default)]
    pub service_instance_id: String,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Summary stream configuration.
    #[serde(default)]
    pub summary: SummaryConfig,

    /// Spend stream configuration.
    #[serde(default)]
    pub spend: SpendConfig,

    #[serde(default)]
    pub freshness: FreshnessConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database holding every table. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Upper bound on any single backend call. Default: 120s.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Summary stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Window length; whole minutes, at most 60m. Default: 60m.
    #[serde(default = "default_summary_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Backlog beyond this many intervals is skipped. Default: 3.
    #[serde(default = "default_max_catchup_intervals")]
    pub max_catchup_intervals: u32,

    /// Most windows aggregated in one tick. Default: 24.
    #[serde(default = "default_max_summary_intervals")]
    pub max_summary_intervals: u32,

    /// Defer scheduled ticks during the first interval after start. Default: true.
    #[serde(default = "default_true")]
    pub startup_grace: bool,

    /// Start of the first window when no checkpoint exists. Default: Unix epoch.
    #[serde(default = "default_backfill_floor")]
    pub backfill_floor: DateTime<Utc>,

    /// Payload fields summed per key.
    #[serde(default = "default_summary_counters")]
    pub counters: Vec<String>,
}

/// Spend stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SpendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first run. Default: 30s.
    #[serde(default = "default_spend_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Fixed delay between the end of one run and the start of the next. Default: 60s.
    #[serde(default = "default_spend_refresh_period", with = "humantime_serde")]
    pub refresh_period: Duration,

    /// Oldest data a scheduled run reads. Default: 1h.
    #[serde(default = "default_spend_max_lookback", with = "humantime_serde")]
    pub max_lookback: Duration,

    /// Payload field summed into the latest-value summary. Default: "targetMatched".
    #[serde(default = "default_spend_counter")]
    pub counter: String,
}

/// Freshness monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default: 5m.
    #[serde(default = "default_freshness_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Staleness threshold as a multiple of the summary interval. Default: 3.
    #[serde(default = "default_max_aggregate_intervals")]
    pub max_aggregate_intervals: u32,

    /// Only markers updated within this span feed gap detection. Default: 1h.
    #[serde(default = "default_marker_lookback", with = "humantime_serde")]
    pub marker_lookback: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_database() -> String {
    "default".to_string()
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_summary_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_max_catchup_intervals() -> u32 {
    3
}

fn default_max_summary_intervals() -> u32 {
    24
}

fn default_backfill_floor() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

fn default_summary_counters() -> Vec<String> {
    [
        "accountAuctions",
        "domainMatched",
        "targetMatched",
        "targetMatchedButFcapped",
        "targetMatchedButFcapLookupFailed",
        "pacingDeferred",
        "sentToBidder",
        "sentToBidderAsTopMatch",
        "receivedFromBidder",
        "responseInvalidated",
        "sentToClient",
        "sentToClientAsTopMatch",
        "winEvents",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_spend_initial_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_spend_refresh_period() -> Duration {
    Duration::from_secs(60)
}

fn default_spend_max_lookback() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_spend_counter() -> String {
    "targetMatched".to_string()
}

fn default_freshness_check_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_aggregate_intervals() -> u32 {
    3
}

fn default_marker_lookback() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            service_instance_id: String::new(),
            clickhouse: ClickHouseConfig::default(),
            summary: SummaryConfig::default(),
            spend: SpendConfig::default(),
            freshness: FreshnessConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            query_timeout: default_query_timeout(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_summary_interval(),
            max_catchup_intervals: default_max_catchup_intervals(),
            max_summary_intervals: default_max_summary_intervals(),
            startup_grace: true,
            backfill_floor: default_backfill_floor(),
            counters: default_summary_counters(),
        }
    }
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: default_spend_initial_delay(),
            refresh_period: default_spend_refresh_period(),
            max_lookback: default_spend_max_lookback(),
            counter: default_spend_counter(),
        }
    }
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_freshness_check_interval(),
            max_aggregate_intervals: default_max_aggregate_intervals(),
            marker_lookback: default_marker_lookback(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse, default and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data).context("parsing YAML")?;

        if cfg.service_instance_id.trim().is_empty() {
            cfg.service_instance_id = uuid::Uuid::new_v4().to_string();
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.service_instance_id.trim().is_empty() {
            bail!("service_instance_id must not be blank");
        }

        // Surfaces interval and bound errors with the planner's wording.
        self.planner_config()?;

        let mut seen = HashSet::new();
        if self.summary.counters.is_empty() {
            bail!("summary.counters must not be empty");
        }
        for counter in &self.summary.counters {
            if counter.trim().is_empty() {
                bail!("summary.counters must not contain blank names");
            }
            if !seen.insert(counter.as_str()) {
                bail!("summary.counters contains duplicate name: {counter}");
            }
        }

        if self.spend.refresh_period.is_zero() {
            bail!("spend.refresh_period must be positive");
        }

        if self.spend.max_lookback.is_zero() {
            bail!("spend.max_lookback must be positive");
        }

        if self.spend.counter.trim().is_empty() {
            bail!("spend.counter must not be blank");
        }

        if self.freshness.check_interval.is_zero() {
            bail!("freshness.check_interval must be positive");
        }

        self.freshness_settings()?;

        if self.clickhouse.query_timeout.is_zero() {
            bail!("clickhouse.query_timeout must be positive");
        }

        Ok(())
    }

    /// Checks the fields needed to talk to ClickHouse.
    pub fn require_clickhouse(&self) -> Result<()> {
        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if self.clickhouse.database.is_empty() {
            bail!("clickhouse.database is required");
        }

        Ok(())
    }

    pub fn planner_config(&self) -> Result<PlannerConfig> {
        PlannerConfig::new(
            to_delta(self.summary.interval, "summary.interval")?,
            self.summary.max_catchup_intervals,
            self.summary.max_summary_intervals,
            self.summary.backfill_floor,
        )
    }

    pub fn counter_set(&self) -> CounterSet {
        CounterSet {
            summary: self.summary.counters.clone(),
            spend: self.spend.counter.clone(),
        }
    }

    pub fn summary_settings(&self) -> Result<SummarySettings> {
        Ok(SummarySettings {
            planner: self.planner_config()?,
            service_instance_id: self.service_instance_id.clone(),
            startup_grace: self.summary.startup_grace,
        })
    }

    pub fn spend_settings(&self) -> Result<SpendSettings> {
        Ok(SpendSettings {
            max_lookback: to_delta(self.spend.max_lookback, "spend.max_lookback")?,
            service_instance_id: self.service_instance_id.clone(),
        })
    }

    pub fn freshness_settings(&self) -> Result<FreshnessSettings> {
        FreshnessSettings::new(
            to_delta(self.summary.interval, "summary.interval")?,
            self.freshness.max_aggregate_intervals,
            to_delta(self.freshness.marker_lookback, "freshness.marker_lookback")?,
        )
    }
}

fn to_delta(d: Duration, field: &str) -> Result<TimeDelta> {
    TimeDelta::from_std(d).with_context(|| format!("{field} is out of range"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::from_yaml("{}").expect("defaults are valid");

        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.summary.interval, Duration::from_secs(3600));
        assert_eq!(cfg.summary.max_catchup_intervals, 3);
        assert_eq!(cfg.summary.max_summary_intervals, 24);
        assert_eq!(cfg.summary.backfill_floor, DateTime::UNIX_EPOCH);
        assert_eq!(cfg.spend.max_lookback, Duration::from_secs(3600));
        assert_eq!(cfg.freshness.marker_lookback, Duration::from_secs(3600));
        assert_eq!(cfg.health.addr, ":9090");
        assert!(uuid::Uuid::parse_str(&cfg.service_instance_id).is_ok());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
log_level: debug
service_instance_id: node-a
clickhouse:
  endpoint: "ch:9000"
  database: stats
  query_timeout: 30s
  migrations:
    enabled: true
summary:
  interval: 15m
  max_catchup_intervals: 4
  max_summary_intervals: 8
  startup_grace: false
  backfill_floor: "2020-01-01T00:00:00Z"
  counters: [a, b]
spend:
  enabled: false
  refresh_period: 2m
  max_lookback: 30m
  counter: b
freshness:
  check_interval: 1m
  max_aggregate_intervals: 2
health:
  addr: ":9191"
"#;
        let cfg = Config::from_yaml(yaml).expect("valid config");

        assert_eq!(cfg.service_instance_id, "node-a");
        assert_eq!(cfg.clickhouse.query_timeout, Duration::from_secs(30));
        assert!(cfg.clickhouse.migrations.enabled);
        assert_eq!(cfg.summary.interval, Duration::from_secs(15 * 60));
        assert!(!cfg.summary.startup_grace);
        assert!(!cfg.spend.enabled);

        let planner = cfg.planner_config().expect("planner");
        assert_eq!(planner.interval(), TimeDelta::minutes(15));
        assert_eq!(planner.max_catchup_intervals(), 4);

        let counters = cfg.counter_set();
        assert_eq!(counters.summary, vec!["a", "b"]);
        assert_eq!(counters.spend, "b");

        let freshness = cfg.freshness_settings().expect("freshness");
        assert_eq!(freshness.threshold(), TimeDelta::minutes(30));
    }

    #[test]
    fn test_rejects_bad_intervals() {
        for interval in ["0s", "90s", "2h"] {
            let yaml = format!("summary:\n  interval: {interval}\n");
            assert!(
                Config::from_yaml(&yaml).is_err(),
                "interval {interval} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_zero_bounds() {
        assert!(Config::from_yaml("summary:\n  max_catchup_intervals: 0\n").is_err());
        assert!(Config::from_yaml("summary:\n  max_summary_intervals: 0\n").is_err());
        assert!(Config::from_yaml("freshness:\n  max_aggregate_intervals: 0\n").is_err());
        assert!(Config::from_yaml("spend:\n  refresh_period: 0s\n").is_err());
    }

    #[test]
    fn test_rejects_bounds_beyond_i32() {
        let err = Config::from_yaml("summary:\n  max_catchup_intervals: 4294967295\n")
            .expect_err("catch-up bound overflows");
        assert!(format!("{err:#}").contains("max_catchup_intervals is too large"));

        let err = Config::from_yaml("freshness:\n  max_aggregate_intervals: 3000000000\n")
            .expect_err("freshness bound overflows");
        assert!(format!("{err:#}").contains("max_aggregate_intervals is too large"));
    }

    #[test]
    fn test_rejects_bad_counters() {
        assert!(Config::from_yaml("summary:\n  counters: []\n").is_err());

        let err = Config::from_yaml("summary:\n  counters: [a, a]\n").expect_err("duplicate");
        assert!(format!("{err:#}").contains("duplicate name: a"));

        assert!(Config::from_yaml("summary:\n  counters: [a, ' ']\n").is_err());
    }

    #[test]
    fn test_require_clickhouse() {
        let cfg = Config::from_yaml("{}").expect("defaults");
        assert!(cfg.require_clickhouse().is_err());

        let cfg = Config::from_yaml("clickhouse:\n  endpoint: ch:9000\n").expect("valid");
        assert!(cfg.require_clickhouse().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "service_instance_id: from-file").expect("write config");

        let cfg = Config::load(file.path()).expect("load config");
        assert_eq!(cfg.service_instance_id, "from-file");

        let err = Config::load(Path::new("/nonexistent/windowfold.yaml")).expect_err("missing");
        assert!(err.to_string().contains("reading config file"));
    }
}
