//! Bounded polling.
//!
//! Every hardware wait in the engine is a loop with a poll interval and a
//! total budget. The number of iterations is derived from the two before
//! the loop starts, so a register that never changes ends the loop with
//! `Ok(None)` instead of hanging.

use crate::error::Result;
use std::time::{Duration, Instant};

/// How a wait passes time between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Yield the thread with `sleep`.
    #[default]
    Sleep,
    /// Busy-wait. For callers that must not block, such as the drain path.
    Spin,
}

impl WaitMode {
    /// Let `interval` pass.
    pub fn pause(self, interval: Duration) {
        match self {
            Self::Sleep => std::thread::sleep(interval),
            Self::Spin => {
                let start = Instant::now();
                while start.elapsed() < interval {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

/// Parameters for one bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Delay between probes.
    pub interval: Duration,
    /// Total time allowed.
    pub budget: Duration,
    /// How to pass the delay.
    pub mode: WaitMode,
}

impl PollConfig {
    /// Wait described by an interval and a budget.
    pub const fn new(interval: Duration, budget: Duration, mode: WaitMode) -> Self {
        Self {
            interval,
            budget,
            mode,
        }
    }

    /// Number of probes the budget allows, at least one.
    pub fn max_polls(&self) -> u64 {
        let interval = self.interval.as_nanos().max(1);
        u64::try_from(self.budget.as_nanos() / interval)
            .unwrap_or(u64::MAX)
            .max(1)
    }

    /// Probe until it yields a value or the budget runs out.
    ///
    /// Returns `Ok(None)` on exhaustion. Errors from `probe` end the wait.
    pub fn poll<T>(&self, mut probe: impl FnMut() -> Result<Option<T>>) -> Result<Option<T>> {
        let polls = self.max_polls();
        for i in 0..polls {
            if let Some(v) = probe()? {
                return Ok(Some(v));
            }
            if i + 1 < polls {
                self.mode.pause(self.interval);
            }
        }
        Ok(None)
    }
}
