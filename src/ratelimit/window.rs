//! Fixed-window counter implementation.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Further admissions left in the current window after this check
    pub remaining: u64,
}

impl Decision {
    fn admit(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
        }
    }

    fn reject() -> Self {
        Self {
            allowed: false,
            remaining: 0,
        }
    }
}

/// A fixed-window rate limit counter.
///
/// Admits up to `limit` requests per window. The window is not aligned to the
/// wall clock: it restarts at the first check that lands strictly after
/// `window_start + window`. A check landing exactly on that boundary still
/// belongs to the old window. Bursts straddling a reset can therefore see up
/// to `2 * limit - 1` admissions in a short span.
///
/// All state lives behind one mutex scoped to the instance, so counters for
/// different keys never contend.
#[derive(Debug)]
pub struct WindowCounter {
    /// The limit for this counter
    limit: u64,
    /// Length of each window
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    /// When the current window started
    window_start: Instant,
    /// Requests admitted in the current window
    count: u64,
    /// Time of the most recent admission check, admitted or not
    last_activity: Instant,
}

impl WindowCounter {
    /// Create a new counter whose first window starts now.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self::starting_at(limit, window, Instant::now())
    }

    /// Create a new counter whose first window starts at `start`.
    pub fn starting_at(limit: u64, window: Duration, start: Instant) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                window_start: start,
                count: 0,
                last_activity: start,
            }),
        }
    }

    /// Check whether one more request fits in the current window.
    pub fn allow(&self) -> Decision {
        self.allow_at(Instant::now())
    }

    /// Same as [`allow`](Self::allow), evaluated at `now`.
    pub fn allow_at(&self, now: Instant) -> Decision {
        let mut state = self.state.lock();

        // Rejected checks count as activity too; the idle sweep relies on it.
        state.last_activity = now;

        if now.saturating_duration_since(state.window_start) > self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count < self.limit {
            state.count += 1;
            Decision::admit(self.limit - state.count)
        } else {
            Decision::reject()
        }
    }

    /// Get the time of the last admission check.
    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    /// How long the counter has gone without an admission check, as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Get the number of admissions in the current window.
    ///
    /// Reports zero once the window has lapsed, without starting a new one.
    pub fn current_count(&self) -> u64 {
        let state = self.state.lock();
        if state.window_start.elapsed() > self.window {
            0
        } else {
            state.count
        }
    }

    /// Get the remaining quota.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count())
    }

    /// Get the limit for this counter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the window length for this counter.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the duration until the current window lapses.
    pub fn duration_until_reset(&self) -> Duration {
        let elapsed = self.state.lock().window_start.elapsed();
        self.window.saturating_sub(elapsed)
    }
}
