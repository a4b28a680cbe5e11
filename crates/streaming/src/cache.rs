use std::collections::BTreeMap;
use std::sync::Arc;

use foundation::time::{Clock, SystemClock, Timestamp};
use parking_lot::Mutex;

/// How long an entry may stay unused before `flush` evicts it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lifetime {
    Infinite,
    Millis(u64),
}

impl Lifetime {
    fn expired(self, idle_ms: u64) -> bool {
        match self {
            Lifetime::Infinite => false,
            Lifetime::Millis(ms) => ms < idle_ms,
        }
    }
}

/// Common lifetimes for fetched resources.
pub struct CachePolicy;

impl CachePolicy {
    pub const INFINITE: Lifetime = Lifetime::Infinite;
    pub const TEXTURE: Lifetime = Lifetime::Millis(15 * 60 * 1000);
    pub const ELEVATION: Lifetime = Lifetime::Millis(15 * 60 * 1000);
    pub const GEOMETRY: Lifetime = Lifetime::Millis(15 * 60 * 1000);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub before: usize,
    pub after: usize,
    pub hit: u64,
    pub miss: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    last_used: Timestamp,
    lifetime: Lifetime,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: BTreeMap<String, CacheEntry<V>>,
    hit: u64,
    miss: u64,
}

/// Best-effort key/value cache with idle-time expiry.
///
/// Notes:
/// - Keys live in a `BTreeMap`, so prefix deletion is a range scan.
/// - Reads refresh an entry's last-used time; expiry only happens in `flush`.
/// - The cache is never a source of truth: a miss just means "fetch again".
pub struct Cache<V> {
    state: Mutex<CacheState<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> Cache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: BTreeMap::new(),
                hit: 0,
                miss: 0,
            }),
            clock,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = now;
                let value = entry.value.clone();
                state.hit += 1;
                Some(value)
            }
            None => {
                state.miss += 1;
                None
            }
        }
    }

    /// Inserts an entry that never expires.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.set(key, value, Lifetime::Infinite);
    }

    pub fn set(&self, key: impl Into<String>, value: V, lifetime: Lifetime) {
        let now = self.clock.now();
        self.state.lock().entries.insert(
            key.into(),
            CacheEntry {
                value,
                last_used: now,
                lifetime,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Removes every key starting with `prefix`. Returns how many went.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            state.entries.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn flush(&self) -> FlushReport {
        self.flush_at(self.clock.now())
    }

    /// Evicts entries idle for longer than their lifetime at `reference`,
    /// then reports and resets the hit/miss counters.
    pub fn flush_at(&self, reference: Timestamp) -> FlushReport {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !e.lifetime.expired(reference.millis_since(e.last_used)));
        let report = FlushReport {
            before,
            after: state.entries.len(),
            hit: state.hit,
            miss: state.miss,
        };
        state.hit = 0;
        state.miss = 0;
        report
    }
}

impl<V: Clone> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cache")
            .field("len", &state.entries.len())
            .field("hit", &state.hit)
            .field("miss", &state.miss)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, CachePolicy, FlushReport, Lifetime};
    use foundation::time::{ManualClock, Timestamp};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn cache_at(t: u64) -> (Arc<ManualClock>, Cache<u32>) {
        let clock = Arc::new(ManualClock::new(Timestamp(t)));
        let cache = Cache::with_clock(clock.clone());
        (clock, cache)
    }

    #[test]
    fn get_refreshes_last_used() {
        let (clock, cache) = cache_at(0);
        cache.set("a", 1, Lifetime::Millis(1000));

        clock.set(Timestamp(500));
        assert_eq!(cache.get("a"), Some(1));

        // 500 + 1000 = 1500 > 1400: still alive.
        let report = cache.flush_at(Timestamp(1400));
        assert_eq!(report.after, 1);

        let report = cache.flush_at(Timestamp(1600));
        assert_eq!((report.before, report.after), (1, 0));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn ttl_boundary() {
        let (_clock, cache) = cache_at(100);
        cache.set("k", 7, Lifetime::Millis(50));
        assert_eq!(cache.flush_at(Timestamp(149)).after, 1);
        assert_eq!(cache.flush_at(Timestamp(150)).after, 1);
        assert_eq!(cache.flush_at(Timestamp(151)).after, 0);
    }

    #[test]
    fn infinite_entries_survive_flush() {
        let (_clock, cache) = cache_at(0);
        cache.set("forever", 1, CachePolicy::INFINITE);
        cache.set("texture", 2, CachePolicy::TEXTURE);
        let report = cache.flush_at(Timestamp(u64::MAX));
        assert_eq!((report.before, report.after), (2, 1));
        assert!(cache.contains("forever"));
    }

    #[test]
    fn flush_reports_and_resets_hit_miss() {
        let (_clock, cache) = cache_at(0);
        cache.insert("a", 1);
        let _ = cache.get("a");
        let _ = cache.get("a");
        let _ = cache.get("b");

        assert_eq!(
            cache.flush(),
            FlushReport {
                before: 1,
                after: 1,
                hit: 2,
                miss: 1
            }
        );
        let again = cache.flush();
        assert_eq!((again.hit, again.miss), (0, 0));
    }

    #[test]
    fn delete_prefix_only_touches_matching_keys() {
        let (_clock, cache) = cache_at(0);
        cache.insert("ortho/1/0/0", 1);
        cache.insert("ortho/1/0/1", 2);
        cache.insert("orthoX", 3);
        cache.insert("dem/1/0/0", 4);

        assert_eq!(cache.delete_prefix("ortho/"), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.delete("dem/1/0/0"));
        assert!(!cache.delete("dem/1/0/0"));

        cache.clear();
        assert!(cache.is_empty());
    }
}
