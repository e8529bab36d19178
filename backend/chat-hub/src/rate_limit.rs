//! In-memory sliding-window rate limiting for inbound commands.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Sliding-window limiter keyed by an arbitrary string (usually a user id).
///
/// Each key keeps the timestamps of the calls it allowed inside the trailing
/// window. A key's stale timestamps are dropped when it is checked, and at
/// most once per window every key is swept, so idle keys are forgotten and
/// memory tracks only active keys.
#[derive(Debug)]
pub struct WindowLimiter {
    limit: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    entries: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl WindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true and records the call if `key` is under its budget.
    /// A rejected call is not recorded.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub(crate) fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.last_sweep) >= self.window {
            let window = self.window;
            state.entries.retain(|_, stamps| {
                compact(stamps, now, window);
                !stamps.is_empty()
            });
            state.last_sweep = now;
        }

        match state.entries.get_mut(key) {
            Some(stamps) => {
                compact(stamps, now, self.window);
                if stamps.len() >= self.limit {
                    false
                } else {
                    stamps.push_back(now);
                    true
                }
            }
            None if self.limit == 0 => false,
            None => {
                state.entries.insert(key.to_string(), VecDeque::from([now]));
                true
            }
        }
    }

    /// Number of keys currently holding timestamps.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().entries.len()
    }
}

fn compact(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allows_exactly_limit_calls_per_window() {
        let limiter = WindowLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter.allow_at("u1:typing", start + Duration::from_millis(i)));
        }
        assert!(!limiter.allow_at("u1:typing", start + Duration::from_millis(5)));
    }

    #[test]
    fn window_slides() {
        let limiter = WindowLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at("k", start));
        assert!(limiter.allow_at("k", start + Duration::from_secs(4)));
        assert!(!limiter.allow_at("k", start + Duration::from_secs(9)));
        // the first call leaves the window, freeing one slot
        assert!(limiter.allow_at("k", start + Duration::from_secs(10)));
        assert!(!limiter.allow_at("k", start + Duration::from_secs(11)));
        assert!(limiter.allow_at("k", start + Duration::from_secs(14)));
    }

    #[test]
    fn rejected_calls_are_not_recorded() {
        let limiter = WindowLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at("k", start));
        for s in 1..9 {
            assert!(!limiter.allow_at("k", start + Duration::from_secs(s)));
        }
        assert!(limiter.allow_at("k", start + Duration::from_secs(10)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = WindowLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.allow("alice:read"));
        assert!(limiter.allow("bob:read"));
        assert!(limiter.allow("alice:typing"));
        assert!(!limiter.allow("alice:read"));
    }

    #[test]
    fn idle_keys_are_forgotten_after_a_window() {
        let limiter = WindowLimiter::new(5, Duration::from_secs(1));
        let start = Instant::now();
        limiter.allow_at("a", start);
        limiter.allow_at("b", start);
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.allow_at("a", start + Duration::from_secs(2));
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(
            limiter.state.lock().entries.get("a").map(|s| s.len()),
            Some(1)
        );
    }

    #[test]
    fn memory_tracks_only_active_keys() {
        let limiter = WindowLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();
        for i in 0..1000 {
            assert!(limiter.allow_at(&format!("user-{i}"), start));
        }
        assert_eq!(limiter.tracked_keys(), 1000);

        assert!(limiter.allow_at("fresh", start + Duration::from_secs(2)));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn sweep_keeps_keys_still_inside_their_window() {
        let limiter = WindowLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.allow_at("old", start));
        assert!(limiter.allow_at("recent", start + Duration::from_secs(8)));

        assert!(limiter.allow_at("other", start + Duration::from_secs(12)));
        assert_eq!(limiter.tracked_keys(), 2);
        assert!(!limiter.allow_at("recent", start + Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn recovers_after_real_window_elapses() {
        let limiter = WindowLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.allow("k"));
    }

    #[test]
    fn concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(WindowLimiter::new(50, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.allow("shared")).count())
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
