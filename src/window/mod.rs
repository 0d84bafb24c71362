pub mod planner;

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AggregationError;

/// Half-open time range `[start, end)` over which raw records are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl AggregationWindow {
    /// Creates a window, rejecting empty or inverted bounds.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AggregationError> {
        if end <= start {
            return Err(AggregationError::InvalidWindow { start, end });
        }

        Ok(Self { start, end })
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Width of the window.
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Returns true when `t` falls inside `[start, end)`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// Returns true when `[start, end)` lies entirely inside this window.
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start >= self.start && end <= self.end
    }
}

impl fmt::Display for AggregationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

/// Truncates `t` down to the start of its minute.
pub fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to(t, TimeDelta::minutes(1))
}

/// Truncates `t` down to a multiple of `step` counted from the Unix epoch.
///
/// Steps shorter than one second leave `t` untouched.
pub fn truncate_to(t: DateTime<Utc>, step: TimeDelta) -> DateTime<Utc> {
    let step_secs = step.num_seconds();
    if step_secs <= 0 {
        return t;
    }

    let secs = t.timestamp();
    let truncated = secs - secs.rem_euclid(step_secs);
    DateTime::from_timestamp(truncated, 0).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, h, m, s)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn test_new_rejects_inverted_bounds() {
        let err = AggregationWindow::new(at(2, 0, 0), at(1, 0, 0)).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidWindow { .. }));
    }

    #[test]
    fn test_new_rejects_empty_window() {
        assert!(AggregationWindow::new(at(1, 0, 0), at(1, 0, 0)).is_err());
    }

    #[test]
    fn test_contains_is_half_open() {
        let window = AggregationWindow::new(at(1, 0, 0), at(2, 0, 0)).expect("valid window");
        assert!(window.contains(at(1, 0, 0)));
        assert!(window.contains(at(1, 59, 59)));
        assert!(!window.contains(at(2, 0, 0)));
        assert!(!window.contains(at(0, 59, 59)));
        assert_eq!(window.duration(), TimeDelta::hours(1));
    }

    #[test]
    fn test_display() {
        let window = AggregationWindow::new(at(1, 0, 0), at(2, 0, 0)).expect("valid window");
        assert_eq!(
            window.to_string(),
            "[2020-01-01T01:00:00+00:00, 2020-01-01T02:00:00+00:00)"
        );
    }

    #[test]
    fn test_truncate_to_minute() {
        assert_eq!(truncate_to_minute(at(1, 7, 42)), at(1, 7, 0));
        let with_nanos = at(1, 7, 0) + TimeDelta::milliseconds(250);
        assert_eq!(truncate_to_minute(with_nanos), at(1, 7, 0));
    }

    #[test]
    fn test_truncate_to_interval() {
        assert_eq!(truncate_to(at(1, 47, 3), TimeDelta::minutes(15)), at(1, 45, 0));
        assert_eq!(truncate_to(at(1, 47, 3), TimeDelta::hours(1)), at(1, 0, 0));
        assert_eq!(truncate_to(at(1, 47, 3), TimeDelta::zero()), at(1, 47, 3));
    }
}
