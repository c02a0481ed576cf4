//! Fixed-window request and token budget for provider calls.
//!
//! Each window admits at most `max_requests` calls and `max_tokens`
//! estimated tokens. A caller that would exceed either budget sleeps until
//! the window rolls over. A single request larger than the whole token
//! budget is admitted alone into an otherwise empty window.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Window {
    started: Instant,
    requests: u32,
    tokens: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    max_tokens: u64,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, max_tokens: u64, window: Duration) -> Self {
        Self {
            max_requests,
            max_tokens,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                requests: 0,
                tokens: 0,
            }),
        }
    }

    /// Reserve one request carrying `tokens`, or report how long to wait.
    fn try_acquire(&self, tokens: u64) -> Result<(), Duration> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.requests = 0;
            state.tokens = 0;
        }

        let empty = state.requests == 0;
        let fits_tokens = empty || state.tokens + tokens <= self.max_tokens;
        if state.requests < self.max_requests && fits_tokens {
            state.requests += 1;
            state.tokens += tokens;
            return Ok(());
        }
        Err((state.started + self.window).saturating_duration_since(now))
    }

    /// Wait until the current window has room for one request of `tokens`.
    pub async fn acquire(&self, tokens: u64) {
        loop {
            match self.try_acquire(tokens) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, tokens, "rate budget exhausted, waiting");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn request_budget_rolls_over() {
        let limiter = RateLimiter::new(2, 1_000, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire(1).await;
        limiter.acquire(1).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn token_budget_limits_window() {
        let limiter = RateLimiter::new(100, 10, Duration::from_secs(5));
        let start = Instant::now();
        limiter.acquire(6).await;
        assert!(limiter.try_acquire(6).is_err());
        limiter.acquire(4).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        limiter.acquire(6).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_admitted_alone() {
        let limiter = RateLimiter::new(10, 5, Duration::from_secs(5));
        let start = Instant::now();
        limiter.acquire(50).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
