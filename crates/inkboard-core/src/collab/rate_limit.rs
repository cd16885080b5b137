//! Sliding-window limiter for outbound state-changing actions.
//!
//! Actions beyond the cap are dropped, not queued.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    /// Timestamps of recorded actions, oldest first.
    recent: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            recent: VecDeque::with_capacity(limit),
        }
    }

    /// Check the limit and record the action if it is allowed.
    pub fn check_and_record(&mut self) -> bool {
        self.check_and_record_at(Instant::now())
    }

    /// Same as [`check_and_record`](Self::check_and_record) with an explicit clock.
    pub fn check_and_record_at(&mut self, now: Instant) -> bool {
        prune_window(&mut self.recent, now, self.window);
        if self.recent.len() >= self.limit {
            return false;
        }
        self.recent.push_back(now);
        true
    }

    /// Actions counted in the window ending at `now`.
    pub fn in_window_at(&mut self, now: Instant) -> usize {
        prune_window(&mut self.recent, now, self.window);
        self.recent.len()
    }
}

fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = deque.front() {
        if now.saturating_duration_since(front) >= window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let mut rl = RateLimiter::new(50, Duration::from_secs(1));
        let now = Instant::now();
        for i in 0..50 {
            assert!(rl.check_and_record_at(now), "action {i} should pass");
        }
        assert!(!rl.check_and_record_at(now));
        assert_eq!(rl.in_window_at(now), 50);
    }

    #[test]
    fn test_window_slides() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        assert!(rl.check_and_record_at(start));
        assert!(rl.check_and_record_at(start + Duration::from_millis(600)));
        assert!(!rl.check_and_record_at(start + Duration::from_millis(900)));
        // The first action has aged out.
        assert!(rl.check_and_record_at(start + Duration::from_millis(1000)));
        assert!(!rl.check_and_record_at(start + Duration::from_millis(1500)));
        assert!(rl.check_and_record_at(start + Duration::from_millis(1600)));
    }
}
