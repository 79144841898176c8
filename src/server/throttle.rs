//! Sliding-window rate limiter for inbound frames

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Allows at most `limit` events per rolling `window`
///
/// Callers over the limit are delayed, never rejected.
#[derive(Debug)]
pub struct Throttle {
    limit: usize,
    window: Duration,
    times: VecDeque<Instant>,
}

impl Throttle {
    /// Create a limiter; a limit of 0 disables it
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            times: VecDeque::with_capacity(limit),
        }
    }

    /// Per-second limiter
    pub fn per_second(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    /// How long an event at `now` must wait before being admitted
    pub fn delay(&self, now: Instant) -> Duration {
        if self.limit == 0 || self.times.len() < self.limit {
            return Duration::ZERO;
        }
        match self.times.front() {
            Some(oldest) => self.window.saturating_sub(now.saturating_duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    /// Wait until an event is allowed, then record it
    pub async fn acquire(&mut self) {
        if self.limit == 0 {
            return;
        }

        let delay = self.delay(Instant::now());
        if !delay.is_zero() {
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Inbound rate limited");
            tokio::time::sleep(delay).await;
        }

        if self.times.len() >= self.limit {
            self.times.pop_front();
        }
        self.times.push_back(Instant::now());
    }
}
