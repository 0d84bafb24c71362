pub mod spend;
pub mod summary;

use serde::Serialize;

use crate::checkpoint::MarkerKind;
use crate::error::AggregationError;
use crate::window::AggregationWindow;

/// How a summary window run was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Checkpoint driven; advances the stream cursor and fresh markers.
    Incremental,
    /// Caller supplied bounds; never touches the stream cursor.
    Recreate,
}

impl RunMode {
    pub fn marker_kind(self) -> MarkerKind {
        match self {
            Self::Incremental => MarkerKind::Fresh,
            Self::Recreate => MarkerKind::Recreated,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Recreate => "recreate",
        }
    }
}

/// Result of aggregating one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowOutcome {
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub written: u64,
    pub skipped: u64,
    pub markers: usize,
}

impl WindowOutcome {
    fn new(window: &AggregationWindow) -> Self {
        Self {
            start: window.start(),
            end: window.end(),
            written: 0,
            skipped: 0,
            markers: 0,
        }
    }
}

/// Metric label for an error class.
pub(crate) fn error_type(err: &AggregationError) -> &'static str {
    match err {
        AggregationError::InvalidWindow { .. } => "invalid_window",
        AggregationError::Conflict { .. } => "conflict",
        AggregationError::Checkpoint(_) => "checkpoint",
        AggregationError::Backend(_) => "backend",
    }
}
