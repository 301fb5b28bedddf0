use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Sliding-window limiter: at most `max_attempts` per key within `window`.
pub struct RateLimiter {
    attempts: HashMap<String, VecDeque<Instant>>,
    max_attempts: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            attempts: HashMap::new(),
            max_attempts: max_attempts.max(1),
            window,
        }
    }

    /// Record an attempt for `key`. On rejection returns how long until the
    /// oldest attempt leaves the window.
    pub fn check(&mut self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&mut self, key: &str, now: Instant) -> Result<(), Duration> {
        let window = self.window;
        let seen = self.attempts.entry(key.to_string()).or_default();
        while seen
            .front()
            .is_some_and(|first| now.duration_since(*first) >= window)
        {
            seen.pop_front();
        }

        if seen.len() >= self.max_attempts as usize {
            let oldest = seen.front().copied().unwrap_or(now);
            return Err(window.saturating_sub(now.duration_since(oldest)));
        }
        seen.push_back(now);
        Ok(())
    }

    /// Forget keys with no attempts left in the window.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.attempts.retain(|_, seen| {
            seen.back()
                .is_some_and(|last| now.duration_since(*last) < window)
        });
    }
}
