//! Fixed-window counter.

use std::time::Duration;
use tokio::time::Instant;

/// Outcome of recording one attempt against a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    /// Whether this attempt fits within the limit
    pub within_limit: bool,
    /// Attempts recorded in the current window, including this one
    pub count: u64,
    /// Attempts left before the limit is reached
    pub remaining: u64,
    /// Time until the current window closes
    pub reset_in: Duration,
}

/// A fixed-window counter for one (rule, identifier) pair.
///
/// The window opens at the first attempt and closes `window` later; the next
/// attempt after that opens a fresh window. Every attempt is counted, including
/// rejected ones. The counter holds no lock of its own: callers serialize
/// access through the map entry that owns it.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    /// When the current window started
    window_start: Instant,
    /// Attempts in the current window
    count: u64,
}

impl WindowCounter {
    /// Create a counter whose first window opens at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Record an attempt and check it against `limit`.
    pub fn hit(&mut self, now: Instant, window: Duration, limit: u64) -> WindowStatus {
        if self.is_expired(now, window) {
            self.window_start = now;
            self.count = 0;
        }

        self.count = self.count.saturating_add(1);

        WindowStatus {
            within_limit: self.count <= limit,
            count: self.count,
            remaining: limit.saturating_sub(self.count),
            reset_in: self.reset_in(now, window),
        }
    }

    /// Attempts in the current window as of `now`.
    pub fn current_count(&self, now: Instant, window: Duration) -> u64 {
        if self.is_expired(now, window) {
            0
        } else {
            self.count
        }
    }

    /// Whether the current window has closed.
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    /// Time until the current window closes.
    pub fn reset_in(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.saturating_duration_since(self.window_start))
    }
}
