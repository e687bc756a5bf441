//! Wall-clock aligned sampling schedule.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Smallest instant `>= now` that is a whole multiple of `period` since the
/// Unix epoch.
///
/// Aligning to the epoch keeps the cadence on wall-clock boundaries no matter
/// when the loop started or woke.
pub fn next_fire_time(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_ns = i64::try_from(period.as_nanos()).unwrap_or(i64::MAX).max(1);
    let Some(now_ns) = now.timestamp_nanos_opt() else {
        return now;
    };

    let rem = now_ns.rem_euclid(period_ns);
    if rem == 0 {
        return now;
    }
    match now_ns.checked_add(period_ns - rem) {
        Some(next) => DateTime::from_timestamp_nanos(next),
        None => now,
    }
}

/// Tracks the last tick that fired so that a tick is never sampled twice.
#[derive(Debug, Default, Clone)]
pub struct Cadence {
    last_fired: Option<DateTime<Utc>>,
}

impl Cadence {
    /// Next aligned tick at or after `now`, skipping ticks already fired.
    pub fn next_tick(&self, now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
        let next = next_fire_time(now, period);
        match self.last_fired {
            Some(last) if next <= last => {
                next_fire_time(last + TimeDelta::nanoseconds(1), period)
            }
            _ => next,
        }
    }

    pub fn mark_fired(&mut self, tick: DateTime<Utc>) {
        self.last_fired = Some(tick);
    }
}

/// Time left until the wall-clock `tick`; zero once it has passed.
pub fn time_until(tick: DateTime<Utc>) -> Duration {
    (tick - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
