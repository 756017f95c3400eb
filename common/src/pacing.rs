use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Upper bound on a single wait while sleep mode is on.
pub const SLEEP_STEP: Duration = Duration::from_millis(1_000);

/// Wall-clock deadline for periodic loops. Monotonic tick counts can freeze
/// across a suspend, so the remaining wait is recomputed from the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: DateTime<Utc>,
}

impl Deadline {
    pub fn after(now: DateTime<Utc>, interval: Duration) -> Self {
        let delta = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
        Self {
            at: now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// Next wait towards the deadline, capped at `step`. `None` once it has passed.
    pub fn remaining(&self, now: DateTime<Utc>, step: Duration) -> Option<Duration> {
        let left = (self.at - now).to_std().ok()?;
        if left.is_zero() {
            return None;
        }
        Some(left.min(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn waits_in_bounded_steps() {
        let deadline = Deadline::after(t(0), Duration::from_secs(10));
        assert_eq!(deadline.remaining(t(0), SLEEP_STEP), Some(SLEEP_STEP));
        assert_eq!(
            deadline.remaining(t(0), Duration::from_secs(60)),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn clock_jump_across_suspend_ends_wait() {
        let deadline = Deadline::after(t(0), Duration::from_secs(10));
        assert_eq!(deadline.remaining(t(9), SLEEP_STEP), Some(SLEEP_STEP));
        assert_eq!(deadline.remaining(t(10), SLEEP_STEP), None);
        assert_eq!(deadline.remaining(t(3_600), SLEEP_STEP), None);
    }
}
