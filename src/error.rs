use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the aggregation executors.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("invalid window: end {end} must be after start {start}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("there are {existing} existing summaries in the window, use overwrite to replace them")]
    Conflict { existing: u64 },

    #[error("checkpoint store: {0:#}")]
    Checkpoint(anyhow::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl AggregationError {
    /// Returns true for caller-side validation failures.
    ///
    /// These are reported back to the administrative caller and never alerted.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidWindow { .. } | Self::Conflict { .. })
    }
}
