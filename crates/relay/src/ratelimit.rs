//! Pre-upgrade accept rate limiting.
//!
//! Each source IP gets a fixed one-second window with a counter: the first
//! accept in a window stamps it, the eleventh in the same window is rejected
//! with 429 before the WebSocket handshake. Entries carry their own lock, so
//! distinct IPs never contend beyond the shared map lookup. Once a socket is
//! upgraded there is no further limit.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Upper bound on tracked IPs. A handshake flood rotating source addresses
/// can touch tens of thousands of IPs per second, far beyond what a relay
/// pairing single hosts with single operators ever sees legitimately; at
/// roughly fifty bytes per entry this caps the table at a few megabytes,
/// and expired windows are swept before a newcomer is turned away.
const MAX_TRACKED_IPS: usize = 65_536;

struct IpWindow {
    started: Instant,
    count: u32,
}

pub struct AcceptRateLimiter {
    entries: RwLock<HashMap<IpAddr, Arc<Mutex<IpWindow>>>>,
    max_accepts: u32,
    window: Duration,
    max_tracked: usize,
}

impl AcceptRateLimiter {
    pub fn new(max_accepts: u32, window: Duration) -> Self {
        Self::bounded(max_accepts, window, MAX_TRACKED_IPS)
    }

    fn bounded(max_accepts: u32, window: Duration, max_tracked: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_accepts,
            window,
            max_tracked,
        }
    }

    /// True when this accept is within the IP's window budget; counts it if so.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        // Fast path: a known IP only takes the shared lock for the lookup.
        let known = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.get(&ip).cloned()
        };
        if let Some(entry) = known {
            return self.admit(&entry, now);
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_tracked {
            entries.retain(|_, entry| {
                let window = entry.lock().unwrap_or_else(|e| e.into_inner());
                now.duration_since(window.started) < self.window
            });
            if entries.len() >= self.max_tracked {
                return false;
            }
        }
        let entry = Arc::clone(entries.entry(ip).or_insert_with(|| {
            Arc::new(Mutex::new(IpWindow {
                started: now,
                count: 0,
            }))
        }));
        drop(entries);

        self.admit(&entry, now)
    }

    fn admit(&self, entry: &Mutex<IpWindow>, now: Instant) -> bool {
        let mut window = entry.lock().unwrap_or_else(|e| e.into_inner());
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.max_accepts {
            return false;
        }
        window.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn eleventh_accept_in_window_rejected() {
        let limiter = AcceptRateLimiter::new(10, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at(ip(1), now));
        }
        assert!(!limiter.check_at(ip(1), now));
    }

    #[test]
    fn window_expiry_frees_budget() {
        let limiter = AcceptRateLimiter::new(10, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at(ip(1), now));
        }
        assert!(!limiter.check_at(ip(1), now + Duration::from_millis(900)));
        assert!(limiter.check_at(ip(1), now + Duration::from_millis(1001)));
    }

    #[test]
    fn distinct_ips_do_not_contend() {
        let limiter = AcceptRateLimiter::new(10, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at(ip(1), now));
        }
        assert!(limiter.check_at(ip(2), now));
    }

    #[test]
    fn fresh_window_restores_the_full_budget() {
        let limiter = AcceptRateLimiter::bounded(2, Duration::from_secs(1), MAX_TRACKED_IPS);
        let now = Instant::now();
        assert!(limiter.check_at(ip(3), now));
        assert!(limiter.check_at(ip(3), now + Duration::from_millis(600)));
        assert!(!limiter.check_at(ip(3), now + Duration::from_millis(900)));
        // The window that started at `now` has elapsed; the counter resets
        // and both accepts of the new window fit.
        assert!(limiter.check_at(ip(3), now + Duration::from_millis(1100)));
        assert!(limiter.check_at(ip(3), now + Duration::from_millis(1200)));
    }

    #[test]
    fn tracking_cap_rejects_new_ips_only() {
        let limiter = AcceptRateLimiter::bounded(10, Duration::from_secs(60), 4);
        let now = Instant::now();
        for i in 0..4 {
            assert!(limiter.check_at(ip(i), now));
        }
        assert!(!limiter.check_at(ip(200), now));
        // Already-tracked IPs keep their budget.
        assert!(limiter.check_at(ip(0), now));
    }

    #[test]
    fn expired_entries_are_swept_for_newcomers() {
        let limiter = AcceptRateLimiter::bounded(10, Duration::from_secs(1), 4);
        let now = Instant::now();
        for i in 0..4 {
            assert!(limiter.check_at(ip(i), now));
        }
        // All four windows have elapsed, so the full table makes room.
        assert!(limiter.check_at(ip(200), now + Duration::from_millis(1500)));
    }
}
