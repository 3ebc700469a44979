//! Once-per-period gate for repetitive log lines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lets one event through per period.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    origin: Instant,
    // ms since origin of the last allowed event, plus one; 0 = never
    last: AtomicU64,
}

impl RateLimiter {
    /// Limiter allowing one event per `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Whether an event at this moment may be reported.
    pub fn allow(&self) -> bool {
        let now = u64::try_from(self.origin.elapsed().as_millis())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1);
        let period = u64::try_from(self.period.as_millis()).unwrap_or(u64::MAX);
        let last = self.last.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < period {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_passes_then_quiet() {
        let rl = RateLimiter::new(Duration::from_secs(60));
        assert!(rl.allow());
        assert!(!rl.allow());
        assert!(!rl.allow());
    }

    #[test]
    fn zero_period_always_passes() {
        let rl = RateLimiter::new(Duration::ZERO);
        assert!(rl.allow());
        assert!(rl.allow());
    }

    #[test]
    fn reopens_after_period() {
        let rl = RateLimiter::new(Duration::from_millis(5));
        assert!(rl.allow());
        std::thread::sleep(Duration::from_millis(10));
        assert!(rl.allow());
    }
}
