//! Time source for lease and retention decisions.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Error;

/// Provides the current time. Swapped for [`ManualClock`] in tests so lease
/// expiry can be driven without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// `at + delta`, rejected as invalid input when the result falls outside the
/// representable date range.
pub fn offset(at: DateTime<Utc>, delta: TimeDelta, what: &str) -> Result<DateTime<Utc>, Error> {
    at.checked_add_signed(delta)
        .ok_or_else(|| Error::validation(format!("{what} is out of range")))
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_and_shares_state() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let handle = clock.clone();

        handle.advance(TimeDelta::seconds(31));

        assert_eq!(clock.now(), start + TimeDelta::seconds(31));
    }

    #[test]
    fn test_offset_rejects_dates_out_of_range() {
        let now = Utc::now();

        assert_eq!(
            offset(now, TimeDelta::seconds(30), "visibility_timeout").unwrap(),
            now + TimeDelta::seconds(30)
        );
        assert!(matches!(
            offset(now, TimeDelta::seconds(10_i64.pow(13)), "visibility_timeout"),
            Err(Error::Validation { .. })
        ));
        assert!(offset(now, TimeDelta::MAX, "retry_after").is_err());
    }
}
