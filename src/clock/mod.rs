use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::window::truncate_to;

/// Wall clock aligned to a fixed tick interval.
///
/// Ticks fall on multiples of the interval since the Unix epoch, so a 60m
/// clock fires on the hour and a 15m clock on the quarter hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickClock {
    interval: TimeDelta,
}

impl TickClock {
    pub fn new(interval: TimeDelta) -> Result<Self> {
        if interval <= TimeDelta::zero() {
            bail!("tick interval must be positive, got {interval}");
        }

        Ok(Self { interval })
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    /// Start of the tick containing `now`.
    pub fn current_tick(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        truncate_to(now, self.interval)
    }

    /// First tick strictly after `now`.
    pub fn next_tick(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.current_tick(now) + self.interval
    }

    /// Time left until the next tick.
    pub fn until_next_tick(&self, now: DateTime<Utc>) -> Duration {
        (self.next_tick(now) - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Sleeps until the next tick. Returns `None` if cancelled first.
    pub async fn wait_for_tick(&self, cancel: &CancellationToken) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let tick = self.next_tick(now);

        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.until_next_tick(now)) => Some(tick),
        }
    }
}
