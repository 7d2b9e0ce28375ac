//! Per-user sliding-window rate limiting.
//!
//! Caps how fast one user's events enter the buffer, per action kind. A user
//! over the limit has the event dropped and counted; limits are generous
//! enough that only floods (self-bots, spam raids) hit them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Actions subject to rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Message,
    Edit,
    Mention,
    Reaction,
    EmojiScan,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Edit => "edit",
            Self::Mention => "mention",
            Self::Reaction => "reaction",
            Self::EmojiScan => "emoji_scan",
        }
    }

    /// (events, window) allowed per user.
    fn limit(self) -> (usize, Duration) {
        match self {
            Self::Message => (30, Duration::from_secs(10)),
            Self::Edit => (20, Duration::from_secs(10)),
            Self::Mention => (50, Duration::from_secs(30)),
            Self::Reaction => (40, Duration::from_secs(10)),
            Self::EmojiScan => (50, Duration::from_secs(30)),
        }
    }
}

/// Sliding-window limiter over (action, user) pairs.
pub struct RateLimiter {
    windows: Mutex<HashMap<(Action, i64), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt; returns `true` if it is within the limit.
    pub fn check(&self, action: Action, user_id: i64) -> bool {
        self.check_at(action, user_id, Instant::now())
    }

    fn check_at(&self, action: Action, user_id: i64, now: Instant) -> bool {
        let (max, window) = action.limit();
        let mut windows = self.windows.lock();
        let stamps = windows.entry((action, user_id)).or_default();

        stamps.retain(|&t| now.duration_since(t) < window);
        if stamps.len() >= max {
            metrics::counter!("buffer_events_rate_limited_total", "action" => action.as_str())
                .increment(1);
            return false;
        }
        stamps.push(now);
        true
    }

    /// Drop windows with no recent activity. Called on a maintenance tick to
    /// keep the map from growing with every user ever seen.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        let mut windows = self.windows.lock();
        windows.retain(|(action, _), stamps| {
            let (_, window) = action.limit();
            stamps.retain(|&t| now.duration_since(t) < window);
            !stamps.is_empty()
        });
    }

    /// Number of (action, user) windows currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..30 {
            assert!(limiter.check_at(Action::Message, 1, now));
        }
        assert!(!limiter.check_at(Action::Message, 1, now));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..30 {
            assert!(limiter.check_at(Action::Message, 1, start));
        }
        assert!(!limiter.check_at(Action::Message, 1, start));
        // After the window passes, the user is allowed again.
        let later = start + Duration::from_secs(11);
        assert!(limiter.check_at(Action::Message, 1, later));
    }

    #[test]
    fn test_users_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..30 {
            assert!(limiter.check_at(Action::Message, 1, now));
        }
        assert!(!limiter.check_at(Action::Message, 1, now));
        assert!(limiter.check_at(Action::Message, 2, now));
    }

    #[test]
    fn test_actions_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..20 {
            assert!(limiter.check_at(Action::Edit, 1, now));
        }
        assert!(!limiter.check_at(Action::Edit, 1, now));
        assert!(limiter.check_at(Action::Message, 1, now));
    }

    #[test]
    fn test_prune_drops_idle_windows() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.check_at(Action::Message, 1, start);
        assert_eq!(limiter.tracked(), 1);
        // Well past any limit window.
        limiter.prune_at(start + Duration::from_secs(120));
        assert_eq!(limiter.tracked(), 0);
    }
}
