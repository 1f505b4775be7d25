//! Debounce cache for continuous scan sources.
//!
//! A code held steady in front of a camera is observed many times per
//! second; the cache remembers recently processed raw strings so one
//! physical presentation turns into one engine pass instead of dozens of
//! redundant store round-trips.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

// ---------------------------------------------------------------------------
// Clock abstraction
// ---------------------------------------------------------------------------

/// Time source for the cache.
///
/// In production this is [`SystemClock`].  For deterministic tests,
/// [`ManualClock`] advances only when told to, so window expiry can be
/// exercised without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that stands still until advanced.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Bounded map from raw scan string to last processed instant.
///
/// Suppression is measured from the last *processed* observation; repeats
/// inside the window do not push the window forward, so a code held in
/// view re-enters the engine once per window.
pub struct DebounceCache {
    window: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    seen: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for DebounceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceCache")
            .field("window", &self.window)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl DebounceCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self::with_clock(window, capacity, Arc::new(SystemClock))
    }

    /// Capacity is clamped to at least 1.
    pub fn with_clock(window: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            clock,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the scan should be processed (recording it as
    /// seen), `false` when a recent identical observation suppresses it.
    pub fn admit(&self, raw: &str) -> bool {
        let now = self.clock.now();
        let mut seen = self.lock();

        if let Some(&last) = seen.get(raw) {
            if now.duration_since(last) < self.window {
                trace!(raw_len = raw.len(), "scan suppressed by debounce");
                return false;
            }
        }

        if seen.len() >= self.capacity && !seen.contains_key(raw) {
            let window = self.window;
            seen.retain(|_, &mut t| now.duration_since(t) < window);
            if seen.len() >= self.capacity {
                if let Some(oldest) = seen
                    .iter()
                    .min_by_key(|&(_, t)| *t)
                    .map(|(k, _)| k.clone())
                {
                    seen.remove(&oldest);
                }
            }
        }

        seen.insert(raw.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_cache(window_secs: u64, capacity: usize) -> (DebounceCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = DebounceCache::with_clock(
            Duration::from_secs(window_secs),
            capacity,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (cache, clock)
    }

    #[test]
    fn same_string_suppressed_within_window() {
        let (cache, clock) = manual_cache(3, 16);
        assert!(cache.admit("raw-1"));
        assert!(!cache.admit("raw-1"));
        clock.advance(Duration::from_secs(4));
        assert!(cache.admit("raw-1"));
    }

    #[test]
    fn suppressed_repeats_do_not_extend_window() {
        let (cache, clock) = manual_cache(3, 16);
        assert!(cache.admit("raw-1"));
        clock.advance(Duration::from_secs(2));
        assert!(!cache.admit("raw-1"));
        clock.advance(Duration::from_millis(1500));
        // 3.5s after the processed scan, 1.5s after the suppressed repeat.
        assert!(cache.admit("raw-1"));
    }

    #[test]
    fn distinct_strings_are_independent() {
        let (cache, _clock) = manual_cache(3, 16);
        assert!(cache.admit("raw-1"));
        assert!(cache.admit("raw-2"));
        assert!(!cache.admit("raw-1"));
        assert!(!cache.admit("raw-2"));
    }

    #[test]
    fn capacity_evicts_oldest_entry() {
        let (cache, clock) = manual_cache(30, 2);
        assert!(cache.admit("a"));
        clock.advance(Duration::from_secs(1));
        assert!(cache.admit("b"));
        clock.advance(Duration::from_secs(1));
        assert!(cache.admit("c"));
        assert!(cache.len() <= 2);

        // "a" was evicted, "b" is still remembered.
        assert!(!cache.admit("b"));
        assert!(cache.admit("a"));
    }

    #[test]
    fn expired_entries_pruned_before_eviction() {
        let (cache, clock) = manual_cache(3, 2);
        assert!(cache.admit("a"));
        clock.advance(Duration::from_secs(4));
        assert!(cache.admit("b"));
        assert!(cache.admit("c"));
        // "a" expired and was pruned; "b" survives inside the window.
        assert!(!cache.admit("b"));
        assert!(cache.len() <= 2);
    }

    #[test]
    fn system_clock_suppresses_back_to_back_repeats() {
        let cache = DebounceCache::new(Duration::from_secs(10), 16);
        assert!(cache.admit("raw-1"));
        assert!(!cache.admit("raw-1"));
    }
}
