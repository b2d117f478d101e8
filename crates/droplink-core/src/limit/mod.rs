//! Per-source sliding-window rate limiting.
//!
//! Both servers admit requests through one [`RateLimiter`]: each source key
//! (client IP) owns an ordered list of recent request timestamps, pruned to
//! the trailing window on every check. Once the window holds the maximum
//! number of requests, further calls are rejected until old entries age out.
//!
//! State is in-memory only and resets with the server.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window request admission control, keyed by source.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_requests` per `window` per source.
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a request from `source` is admitted right now.
    ///
    /// Admitted requests are recorded against the source's window.
    pub fn admit(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let window = windows.entry(source.to_string()).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            tracing::debug!(source, requests = window.len(), "rate limit exceeded");
            return false;
        }

        window.push_back(now);
        true
    }

    /// Drop all bookkeeping for a source.
    ///
    /// Called when the connection gate evicts a peer so its rate window does
    /// not outlive its registry entry.
    pub fn forget(&self, source: &str) {
        self.windows
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(source);
    }

    /// Number of sources currently tracked.
    #[must_use]
    pub fn tracked_sources(&self) -> usize {
        self.windows
            .lock()
            .expect("rate limiter lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        for _ in 0..60 {
            assert!(limiter.admit("10.0.0.1"));
        }
        assert!(!limiter.admit("10.0.0.1"), "61st call must be rejected");
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.admit("a"));
        assert!(limiter.admit("a"));
        assert!(!limiter.admit("a"));
        assert!(limiter.admit("b"), "other sources keep their own window");
    }

    #[test]
    fn test_window_elapse_readmits() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.admit("k"));
        assert!(limiter.admit("k"));
        assert!(!limiter.admit("k"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(limiter.admit("k"), "admitted again once the window elapsed");
    }

    #[test]
    fn test_forget_clears_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.admit("k"));
        assert!(!limiter.admit("k"));

        limiter.forget("k");
        assert_eq!(limiter.tracked_sources(), 0);
        assert!(limiter.admit("k"));
    }

    #[test]
    fn test_concurrent_admits_same_key() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0;
                for _ in 0..50 {
                    if limiter.admit("shared") {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().expect("join")).sum();
        assert_eq!(total, 100, "exactly the limit admitted across threads");
    }
}
