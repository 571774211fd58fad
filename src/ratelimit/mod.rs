//! Keyed token-bucket rate limiting.
//!
//! Each key owns a bucket of `burst` capacity refilled at `rps` tokens per
//! second. A background sweeper drops buckets that have not been seen for
//! 24 hours so the map stays bounded by the active key population.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the sweeper scans for stale buckets.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Buckets unseen for this long are removed.
pub const ENTRY_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token-bucket rate limiter keyed by an arbitrary string (identity or
/// client IP). Safe for concurrent use from many handler tasks.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rps: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rps: f64, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rps,
            burst: f64::from(burst),
        }
    }

    /// Refill the bucket for `key`, then try to consume one token. Returns
    /// true iff a token was consumed. New keys start with a full bucket.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets whose `last_seen` is older than `expiry`. Returns the
    /// number of entries removed.
    pub fn sweep_expired(&self, expiry: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) <= expiry);
        before - buckets.len()
    }

    /// Number of tracked buckets, for tests and monitoring.
    pub fn active_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Periodic sweeper; runs until the token is cancelled. The caller keeps the
/// join handle and awaits it on shutdown so the stop blocks until the
/// sweeper has exited.
pub async fn run_sweeper(limiter: std::sync::Arc<RateLimiter>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + SWEEP_INTERVAL,
        SWEEP_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = limiter.sweep_expired(ENTRY_EXPIRY);
                if removed > 0 {
                    debug!(removed, "stale rate limit entries swept");
                }
            }
            _ = shutdown.cancelled() => {
                debug!("rate limit sweeper stopped");
                return;
            }
        }
    }
}

/// Resolve the client IP for rate limiting the unauthenticated health probe.
/// The first parseable entry of a forwarded-for header wins; otherwise the
/// transport peer address is used.
pub fn extract_ip(remote_addr: Option<SocketAddr>, forwarded_for: Option<&str>) -> String {
    if let Some(header) = forwarded_for {
        if let Some(first) = header.split(',').next() {
            let candidate = first.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                return candidate.to_string();
            }
        }
    }
    remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_burst_is_honoured() {
        let limiter = RateLimiter::new(1.0, 2);
        assert!(limiter.allow("id:alpha"));
        assert!(limiter.allow("id:alpha"));
        assert!(!limiter.allow("id:alpha"));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = RateLimiter::new(20.0, 1);
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        // At 20 rps one token returns within 50ms.
        thread::sleep(Duration::from_millis(80));
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let limiter = RateLimiter::new(1000.0, 2);
        assert!(limiter.allow("k"));
        thread::sleep(Duration::from_millis(50));
        // Refill far exceeds the burst; only two tokens may be consumed.
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1);
        assert!(limiter.allow("id:alpha"));
        assert!(!limiter.allow("id:alpha"));
        assert!(limiter.allow("id:beta"));
    }

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let limiter = RateLimiter::new(1.0, 1);
        limiter.allow("fresh");
        assert_eq!(limiter.active_count(), 1);

        // Nothing is older than an hour.
        assert_eq!(limiter.sweep_expired(Duration::from_secs(3600)), 0);
        assert_eq!(limiter.active_count(), 1);

        // A zero expiry treats everything as stale.
        thread::sleep(Duration::from_millis(5));
        assert_eq!(limiter.sweep_expired(Duration::ZERO), 1);
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn test_concurrent_allows_never_exceed_burst() {
        let limiter = Arc::new(RateLimiter::new(0.000001, 50));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(thread::spawn(move || {
                let mut allowed = 0u32;
                for _ in 0..20 {
                    if limiter.allow("shared") {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 50, "allowed {total} of a burst of 50");
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let limiter = Arc::new(RateLimiter::new(1.0, 1));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(Arc::clone(&limiter), shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper must exit promptly after cancel")
            .unwrap();
    }

    #[test]
    fn test_extract_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(
            extract_ip(Some(peer), Some("203.0.113.7, 10.0.0.2")),
            "203.0.113.7"
        );
    }

    #[test]
    fn test_extract_ip_ignores_unparseable_forwarded_for() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(extract_ip(Some(peer), Some("not-an-ip")), "10.0.0.1");
    }

    #[test]
    fn test_extract_ip_falls_back_to_unknown() {
        assert_eq!(extract_ip(None, None), "unknown");
    }
}
