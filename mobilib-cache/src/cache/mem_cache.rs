//! Expiring in-memory object map (tier 1).
//!
//! Expiration is pull-based: an entry is only checked, and evicted, when it
//! is read. There is no background sweeper, so entries nobody reads again
//! stay resident until `remove` or `clear`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mobilib_core::{to_chrono, Clock, SystemClock, Timestamp};

#[derive(Debug, Clone)]
struct CachedEntry<T> {
    object: T,
    inserted_at: Timestamp,
}

#[derive(Debug)]
struct MemCacheState<T> {
    entries: HashMap<String, CachedEntry<T>>,
    duration: Duration,
}

impl<T: Clone> MemCacheState<T> {
    fn is_expired(&self, entry: &CachedEntry<T>, now: Timestamp) -> bool {
        if self.duration.is_zero() {
            return false;
        }
        now.signed_duration_since(entry.inserted_at) >= to_chrono(self.duration)
    }

    /// Read with eviction of an expired entry.
    fn get_live(&mut self, id: &str, now: Timestamp) -> Option<T> {
        let expired = match self.entries.get(id) {
            None => return None,
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            self.entries.remove(id);
            None
        } else {
            self.entries.get(id).map(|e| e.object.clone())
        }
    }
}

/// Thread-safe map from object id to `(value, inserted_at)`.
///
/// A single lock guards all state; contention is not a design concern here.
/// A `duration` of zero means entries never expire.
pub struct MemCache<T> {
    state: Mutex<MemCacheState<T>>,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> MemCache<T> {
    pub fn new(duration: Duration) -> Self {
        Self::with_clock(duration, Arc::new(SystemClock))
    }

    pub fn with_clock(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemCacheState {
                entries: HashMap::new(),
                duration,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemCacheState<T>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn duration(&self) -> Duration {
        self.lock().duration
    }

    /// Change the expiration window. Applies to existing entries on their next read.
    pub fn set_duration(&self, duration: Duration) {
        self.lock().duration = duration;
    }

    /// Insert or overwrite, stamped with the current time.
    pub fn put(&self, id: impl Into<String>, object: T) {
        let now = self.clock.now();
        self.put_at(id, object, now);
    }

    /// Insert or overwrite with an explicit insertion time.
    pub fn put_at(&self, id: impl Into<String>, object: T, inserted_at: Timestamp) {
        self.lock().entries.insert(
            id.into(),
            CachedEntry {
                object,
                inserted_at,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<T> {
        let now = self.clock.now();
        self.lock().get_live(id, now)
    }

    /// The live subset of `ids`, paired with their id. Absent or expired ids are skipped.
    pub fn get_many<S: AsRef<str>>(&self, ids: &[S]) -> Vec<(String, T)> {
        let now = self.clock.now();
        let mut state = self.lock();
        ids.iter()
            .filter_map(|id| {
                let id = id.as_ref();
                state.get_live(id, now).map(|o| (id.to_string(), o))
            })
            .collect()
    }

    /// Remove an entry, returning its value whether or not it had expired.
    pub fn remove(&self, id: &str) -> Option<T> {
        self.lock().entries.remove(id).map(|e| e.object)
    }

    pub fn remove_many<S: AsRef<str>>(&self, ids: &[S]) -> Vec<T> {
        let mut state = self.lock();
        ids.iter()
            .filter_map(|id| state.entries.remove(id.as_ref()).map(|e| e.object))
            .collect()
    }

    pub fn contains_key(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Visit every live entry. Expired entries found on the way are evicted.
    ///
    /// The callback runs after the lock is released, so it may call back into
    /// this map.
    pub fn for_each<F: FnMut(&str, &T)>(&self, mut f: F) {
        let now = self.clock.now();
        let live: Vec<(String, T)> = {
            let mut state = self.lock();
            let duration = state.duration;
            state.entries.retain(|_, e| {
                duration.is_zero()
                    || now.signed_duration_since(e.inserted_at) < to_chrono(duration)
            });
            state
                .entries
                .iter()
                .map(|(id, e)| (id.clone(), e.object.clone()))
                .collect()
        };
        for (id, object) in &live {
            f(id, object);
        }
    }

    /// Number of resident entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilib_core::ManualClock;
    use proptest::prelude::*;

    fn cache(duration_ms: u64) -> (MemCache<String>, ManualClock) {
        let clock = ManualClock::at_millis(1_000_000);
        let cache = MemCache::with_clock(Duration::from_millis(duration_ms), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn test_put_and_get() {
        let (cache, _clock) = cache(1_000);
        cache.put("1", "alice".to_string());
        assert_eq!(cache.get("1").as_deref(), Some("alice"));
        assert_eq!(cache.get("2"), None);
    }

    #[test]
    fn test_entry_expires_at_duration() {
        let (cache, clock) = cache(1_000);
        cache.put("1", "alice".to_string());

        clock.advance(Duration::from_millis(999));
        assert!(cache.contains_key("1"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("1"), None);
        // read evicted it
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_zero_duration_never_expires() {
        let (cache, clock) = cache(0);
        cache.put("1", "alice".to_string());
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(cache.get("1").as_deref(), Some("alice"));
    }

    #[test]
    fn test_put_at_uses_given_time() {
        let (cache, clock) = cache(1_000);
        let stale = clock.now() - to_chrono(Duration::from_millis(1_500));
        cache.put_at("1", "old".to_string(), stale);
        assert_eq!(cache.get("1"), None);
    }

    #[test]
    fn test_overwrite_resets_insertion_time() {
        let (cache, clock) = cache(1_000);
        cache.put("1", "v1".to_string());
        clock.advance(Duration::from_millis(800));
        cache.put("1", "v2".to_string());
        clock.advance(Duration::from_millis(800));
        assert_eq!(cache.get("1").as_deref(), Some("v2"));
    }

    #[test]
    fn test_get_many_skips_absent_and_expired() {
        let (cache, clock) = cache(1_000);
        cache.put("a", "A".to_string());
        let stale = clock.now() - to_chrono(Duration::from_secs(5));
        cache.put_at("b", "B".to_string(), stale);

        let found = cache.get_many(&["a", "b", "c"]);
        assert_eq!(found, vec![("a".to_string(), "A".to_string())]);
    }

    #[test]
    fn test_remove_returns_values() {
        let (cache, _clock) = cache(1_000);
        cache.put("a", "A".to_string());
        cache.put("b", "B".to_string());
        cache.put("c", "C".to_string());

        assert_eq!(cache.remove("a").as_deref(), Some("A"));
        assert_eq!(cache.remove("a"), None);

        let mut removed = cache.remove_many(&["b", "c", "zz"]);
        removed.sort();
        assert_eq!(removed, vec!["B", "C"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_for_each_visits_live_entries_only() {
        let (cache, clock) = cache(1_000);
        cache.put("a", "A".to_string());
        let stale = clock.now() - to_chrono(Duration::from_secs(5));
        cache.put_at("b", "B".to_string(), stale);

        let mut seen = Vec::new();
        cache.for_each(|id, v| seen.push((id.to_string(), v.clone())));
        assert_eq!(seen, vec![("a".to_string(), "A".to_string())]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_for_each_callback_may_reenter() {
        let (cache, _clock) = cache(1_000);
        cache.put("a", "A".to_string());
        cache.for_each(|id, _| {
            cache.remove(id);
        });
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_duration_applies_on_next_read() {
        let (cache, clock) = cache(0);
        cache.put("a", "A".to_string());
        clock.advance(Duration::from_secs(10));
        assert!(cache.contains_key("a"));

        cache.set_duration(Duration::from_secs(5));
        assert_eq!(cache.duration(), Duration::from_secs(5));
        assert!(!cache.contains_key("a"));
    }

    #[test]
    fn test_clear() {
        let (cache, _clock) = cache(1_000);
        cache.put("a", "A".to_string());
        cache.clear();
        assert!(cache.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: an entry is visible exactly while its age is below the duration.
        #[test]
        fn prop_visible_iff_younger_than_duration(
            duration_ms in 1u64..10_000,
            age_ms in 0u64..20_000,
        ) {
            let (cache, clock) = cache(duration_ms);
            cache.put("k", "v".to_string());
            clock.advance(Duration::from_millis(age_ms));
            prop_assert_eq!(cache.get("k").is_some(), age_ms < duration_ms);
        }
    }
}
