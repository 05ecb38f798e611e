//! Time source abstraction.
//!
//! Expiration in both the memory map and the existence index is computed
//! against a [`Clock`] so tests can pin "now" exactly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Start at the given epoch milliseconds.
    pub fn at_millis(millis: i64) -> Self {
        Self::new(from_millis(millis))
    }

    pub fn set(&self, to: Timestamp) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = now.checked_add_signed(to_chrono(by)) {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Convert a timestamp to epoch milliseconds (the persisted representation).
pub fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Convert epoch milliseconds back to a timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn from_millis(millis: i64) -> Timestamp {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Saturating conversion from `std::time::Duration`.
pub fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_millis(1_000);
        assert_eq!(to_millis(clock.now()), 1_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(to_millis(clock.now()), 1_250);

        clock.set(from_millis(42));
        assert_eq!(to_millis(clock.now()), 42);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::at_millis(0);
        let other = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(to_millis(other.now()), 1_000);
    }

    #[test]
    fn test_millis_roundtrip_keeps_precision() {
        let ts = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(ts), 1_700_000_000_123);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let a = SystemClock.now();
        let b = SystemClock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_to_chrono_saturates() {
        assert_eq!(to_chrono(Duration::MAX), ChronoDuration::MAX);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_to_chrono_keeps_millis(ms in 0u64..10_000_000_000_000) {
                prop_assert_eq!(to_chrono(Duration::from_millis(ms)).num_milliseconds(), ms as i64);
            }

            #[test]
            fn prop_advance_moves_by_exact_amount(start in 0i64..4_000_000_000_000, by in 0u64..1_000_000_000) {
                let clock = ManualClock::at_millis(start);
                clock.advance(Duration::from_millis(by));
                prop_assert_eq!(to_millis(clock.now()), start + by as i64);
            }
        }
    }
}
