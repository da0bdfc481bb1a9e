//! Sliding-window-by-reset rate limiting, shared by connection admission
//! and per-event throttling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct RateWindow {
    count: u32,
    window_start: Instant,
    window: Duration,
}

/// Per-key counter buckets that reset when their window expires. Keys are
/// opaque strings chosen by the caller (an IP, or `connection:event`).
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true and counts the action if the key is under `limit` for
    /// the current window; returns false without mutation otherwise.
    pub fn try_consume(&self, key: &str, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");

        let entry = windows.entry(key.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
            window,
        });

        if now.duration_since(entry.window_start) > window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.window = window;

        if entry.count < limit {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Evict entries whose window expired more than `grace` ago. One-shot
    /// callers (rotating IPs) would otherwise grow the map without bound.
    pub fn sweep(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let before = windows.len();
        windows.retain(|_, entry| now.duration_since(entry.window_start) <= entry.window + grace);
        before - windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().expect("rate limiter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
