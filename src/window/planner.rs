use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};

use super::{truncate_to_minute, AggregationWindow};

/// Largest supported summary interval.
pub const MAX_INTERVAL_MINUTES: i64 = 60;

/// Parameters driving window planning for the fixed-interval stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    interval: TimeDelta,
    max_catchup_intervals: u32,
    max_summary_intervals: u32,
    backfill_floor: DateTime<Utc>,
    catchup_span: TimeDelta,
    summary_span: TimeDelta,
}

impl PlannerConfig {
    /// Create a planner configuration, refusing intervals the planner cannot tile.
    pub fn new(
        interval: TimeDelta,
        max_catchup_intervals: u32,
        max_summary_intervals: u32,
        backfill_floor: DateTime<Utc>,
    ) -> Result<Self> {
        let minutes = interval.num_minutes();

        if minutes <= 0 {
            bail!("summary interval must be at least one minute, got {interval}");
        }

        if interval != TimeDelta::minutes(minutes) {
            bail!("summary interval must be a whole number of minutes, got {interval}");
        }

        if minutes > MAX_INTERVAL_MINUTES {
            bail!(
                "summary interval of {minutes} minutes exceeds the maximum of \
                 {MAX_INTERVAL_MINUTES} minutes"
            );
        }

        if max_catchup_intervals == 0 {
            bail!("max_catchup_intervals must be > 0");
        }

        if max_summary_intervals == 0 {
            bail!("max_summary_intervals must be > 0");
        }

        let catchup_span = interval_span(interval, max_catchup_intervals)
            .context("max_catchup_intervals is too large")?;
        let summary_span = interval_span(interval, max_summary_intervals)
            .context("max_summary_intervals is too large")?;

        Ok(Self {
            interval,
            max_catchup_intervals,
            max_summary_intervals,
            backfill_floor,
            catchup_span,
            summary_span,
        })
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    pub fn max_catchup_intervals(&self) -> u32 {
        self.max_catchup_intervals
    }

    pub fn max_summary_intervals(&self) -> u32 {
        self.max_summary_intervals
    }

    pub fn backfill_floor(&self) -> DateTime<Utc> {
        self.backfill_floor
    }

    fn catchup_span(&self) -> TimeDelta {
        self.catchup_span
    }

    fn summary_span(&self) -> TimeDelta {
        self.summary_span
    }
}

/// `interval * count`, or `None` when the product does not fit a `TimeDelta`.
pub fn interval_span(interval: TimeDelta, count: u32) -> Option<TimeDelta> {
    interval.checked_mul(i32::try_from(count).ok()?)
}

/// Backlog dropped by the catch-up bound, `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl SkippedRange {
    pub fn duration(&self) -> TimeDelta {
        self.to - self.from
    }
}

/// Outcome of one planning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub first_start: DateTime<Utc>,
    pub final_end: DateTime<Utc>,
    pub interval: TimeDelta,
    pub skipped: Option<SkippedRange>,
}

impl WindowPlan {
    /// Full windows tiling `[first_start, final_end)`.
    ///
    /// A trailing remainder shorter than one interval is left for the next tick.
    pub fn windows(&self) -> Windows {
        Windows {
            next: self.first_start,
            final_end: self.final_end,
            interval: self.interval,
        }
    }

    /// Number of full windows in the plan.
    pub fn window_count(&self) -> usize {
        if self.final_end <= self.first_start {
            return 0;
        }

        let span = (self.final_end - self.first_start).num_seconds();
        let step = self.interval.num_seconds();

        if step <= 0 {
            return 0;
        }

        (span / step) as usize
    }
}

/// Iterator over the windows of a [`WindowPlan`].
#[derive(Debug, Clone)]
pub struct Windows {
    next: DateTime<Utc>,
    final_end: DateTime<Utc>,
    interval: TimeDelta,
}

impl Iterator for Windows {
    type Item = AggregationWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.next + self.interval;
        if end > self.final_end {
            return None;
        }

        let window = AggregationWindow::new(self.next, end).ok()?;
        self.next = end;

        Some(window)
    }
}

/// Compute the windows to process for a tick at `now`.
///
/// Without a checkpoint the plan starts at the backfill floor. The start is
/// then moved back so the distance to `now` is a whole number of intervals,
/// bounded by the catch-up limit, and the end is capped at
/// `max_summary_intervals` windows.
pub fn plan(
    now: DateTime<Utc>,
    last_checkpoint: Option<DateTime<Utc>>,
    cfg: &PlannerConfig,
) -> WindowPlan {
    let now = truncate_to_minute(now);
    let mut start = truncate_to_minute(last_checkpoint.unwrap_or(cfg.backfill_floor));
    let interval_minutes = cfg.interval.num_minutes();

    let distance = (now - start).num_minutes();
    if distance > 0 && interval_minutes > 0 {
        let rem = distance % interval_minutes;
        if rem != 0 {
            start = start + TimeDelta::minutes(rem) - cfg.interval;
        }
    }

    let mut skipped = None;
    let catchup_span = cfg.catchup_span();
    if now - start > catchup_span {
        let forced = truncate_to_minute(now - catchup_span);
        skipped = Some(SkippedRange {
            from: start,
            to: forced,
        });
        start = forced;
    }

    let final_end = now.min(start + cfg.summary_span());

    WindowPlan {
        first_start: start,
        final_end,
        interval: cfg.interval,
        skipped,
    }
}
