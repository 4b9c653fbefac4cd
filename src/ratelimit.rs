use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

// ─── RateLimiter ─────────────────────────────────────────────────

/// Fixed one-minute window over control-plane requests, counted per
/// source IP and globally. A limit of zero disables that dimension.
///
/// Rejections return the seconds until the window rolls, which the
/// handler layer surfaces as `Retry-After`.
pub struct RateLimiter {
    per_ip_limit: u32,
    global_limit: u32,
    window: Duration,
    inner: Mutex<Window>,
}

struct Window {
    started: Instant,
    global: u32,
    per_ip: HashMap<IpAddr, u32>,
}

impl RateLimiter {
    pub fn new(per_ip_limit: u32, global_limit: u32) -> Self {
        Self::with_window(per_ip_limit, global_limit, Duration::from_secs(60))
    }

    pub fn with_window(per_ip_limit: u32, global_limit: u32, window: Duration) -> Self {
        Self {
            per_ip_limit,
            global_limit,
            window,
            inner: Mutex::new(Window {
                started: Instant::now(),
                global: 0,
                per_ip: HashMap::new(),
            }),
        }
    }

    /// Admit or reject one request from `ip`. On rejection, returns
    /// the seconds to wait before retrying.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let mut w = self.inner.lock();

        let elapsed = w.started.elapsed();
        if elapsed >= self.window {
            w.started = Instant::now();
            w.global = 0;
            w.per_ip.clear();
        }

        let retry_after = self
            .window
            .saturating_sub(w.started.elapsed())
            .as_secs()
            .max(1);

        if self.global_limit > 0 && w.global >= self.global_limit {
            return Err(retry_after);
        }
        let count = w.per_ip.entry(ip).or_insert(0);
        if self.per_ip_limit > 0 && *count >= self.per_ip_limit {
            return Err(retry_after);
        }

        *count += 1;
        w.global += 1;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn per_ip_limit_caps_one_address_only() {
        let limiter = RateLimiter::new(2, 100);
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
        // a different address is unaffected
        assert!(limiter.check(ip(2)).is_ok());
    }

    #[test]
    fn global_limit_caps_everyone() {
        let limiter = RateLimiter::new(100, 3);
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(2)).is_ok());
        assert!(limiter.check(ip(3)).is_ok());
        assert!(limiter.check(ip(4)).is_err());
    }

    #[test]
    fn window_roll_resets_counts() {
        let limiter = RateLimiter::with_window(1, 10, Duration::from_millis(30));
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check(ip(1)).is_ok());
    }

    #[test]
    fn rejection_reports_wait_time() {
        let limiter = RateLimiter::new(1, 10);
        limiter.check(ip(1)).unwrap();
        let retry_after = limiter.check(ip(1)).unwrap_err();
        assert!(retry_after >= 1);
        assert!(retry_after <= 60);
    }

    #[test]
    fn zero_limits_disable_enforcement() {
        let limiter = RateLimiter::new(0, 0);
        for _ in 0..1000 {
            assert!(limiter.check(ip(1)).is_ok());
        }
    }
}
