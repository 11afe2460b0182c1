use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding 60-second window of admission instants. Admissions past the
/// ceiling are refused; the window keeps no other cross-command memory.
pub struct RateLimiter {
    window: Mutex<Vec<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Vec::new()),
        }
    }

    /// Record one admission, or refuse if the window is full.
    pub fn admit(&self, ceiling: u32) -> bool {
        self.admit_at(Instant::now(), ceiling)
    }

    fn admit_at(&self, now: Instant, ceiling: u32) -> bool {
        let mut window = self.window.lock();
        window.retain(|instant| now.duration_since(*instant) < WINDOW);
        if window.len() >= ceiling as usize {
            debug!(target: "action-gate", in_window = window.len(), ceiling, "rate ceiling hit");
            return false;
        }
        window.push(now);
        true
    }

    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.retain(|instant| now.duration_since(*instant) < WINDOW);
        window.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
