//! Write-rate limiting with trailing-edge coalescing.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Serializes persistence write requests into at most one write per interval.
///
/// The first request after a quiet period claims a flush slot and is told how
/// long to wait before flushing; requests arriving while a flush is scheduled
/// coalesce into it. The flush is expected to persist whatever state is
/// current when it runs, so coalesced requests are never lost and no stale
/// intermediate state is written.
pub struct RateLimiter {
    min_interval: Duration,
    inner: Mutex<LimiterState>,
}

struct LimiterState {
    last_write: Instant,
    flush_scheduled: bool,
}

impl RateLimiter {
    /// Creates a limiter. The first write slot opens one full interval after
    /// creation.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            inner: Mutex::new(LimiterState {
                last_write: Instant::now(),
                flush_scheduled: false,
            }),
        }
    }

    /// Requests a write slot.
    ///
    /// Returns the delay the caller must wait before flushing, or `None` if a
    /// flush is already scheduled and this request coalesces into it.
    pub fn schedule(&self) -> Option<Duration> {
        let mut state = self.inner.lock().unwrap();
        if state.flush_scheduled {
            return None;
        }
        state.flush_scheduled = true;
        Some(self.min_interval.saturating_sub(state.last_write.elapsed()))
    }

    /// Whether a previously scheduled flush is still pending.
    ///
    /// A scheduled flusher checks this after its delay; an intervening direct
    /// flush (e.g. at shutdown) clears the slot and makes the check fail.
    pub fn flush_pending(&self) -> bool {
        self.inner.lock().unwrap().flush_scheduled
    }

    /// Records the outcome of a flush.
    ///
    /// Only successful writes advance the cooldown; a failed write frees the
    /// slot so the next natural trigger retries.
    pub fn mark_flushed(&self, success: bool) {
        let mut state = self.inner.lock().unwrap();
        state.flush_scheduled = false;
        if success {
            state.last_write = Instant::now();
        }
    }
}
