use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock instant in milliseconds.
///
/// Scheduling, cache expiry and retry backoff all compare timestamps in the
/// same unit, so everything that needs "now" goes through a [`Clock`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, clamped at zero.
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn add_secs_f64(self, secs: f64) -> Self {
        self.add_millis((secs.max(0.0) * 1000.0).round() as u64)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(ms)
    }
}

/// Deterministic clock driven by the caller. Used by tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, t: Timestamp) {
        self.ms.store(t.0, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock, Timestamp};

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Timestamp(10));
        clock.advance(5);
        assert_eq!(clock.now(), Timestamp(15));
        clock.set(Timestamp(2));
        assert_eq!(clock.now(), Timestamp(2));
    }

    #[test]
    fn millis_since_saturates() {
        assert_eq!(Timestamp(5).millis_since(Timestamp(8)), 0);
        assert_eq!(Timestamp(8).millis_since(Timestamp(5)), 3);
        assert_eq!(Timestamp(0).add_secs_f64(1.5), Timestamp(1500));
    }
}
