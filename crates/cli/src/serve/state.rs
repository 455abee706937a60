//! Shared server state and the per-client rate limiter.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use quire_engine::Orchestrator;
use quire_storage::MemoryStore;
use tokio::sync::Mutex;

/// Requests seen from one client in the current window.
#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u64,
}

/// Fixed-window request counter keyed by client IP.
pub(crate) struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, Window>>,
    max_requests: u64,
    window: Duration,
}

impl RateLimiter {
    pub(crate) fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Count a request from `ip`. `Err` carries the seconds until the
    /// client's window resets.
    pub(crate) async fn check(&self, ip: IpAddr) -> Result<(), u64> {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), u64> {
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }
        entry.count += 1;
        if entry.count <= self.max_requests {
            return Ok(());
        }
        let remaining = self
            .window
            .saturating_sub(now.saturating_duration_since(entry.started));
        Err(remaining.as_secs().max(1))
    }

    /// Drop windows that have already ended.
    pub(crate) async fn prune(&self) {
        let now = Instant::now();
        let window = self.window;
        self.windows
            .lock()
            .await
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
    }
}

/// State shared by every handler.
pub(crate) struct AppState {
    pub(crate) engine: Orchestrator<MemoryStore>,
    pub(crate) rate_limiter: RateLimiter,
    /// `None` leaves the owner endpoints open.
    pub(crate) api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[tokio::test]
    async fn limit_is_per_client_and_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        assert!(limiter.check_at(A, start).await.is_ok());
        assert!(limiter.check_at(A, start).await.is_ok());
        let retry = limiter.check_at(A, start).await.unwrap_err();
        assert_eq!(retry, 60);
        assert!(limiter.check_at(B, start).await.is_ok());

        let later = start + Duration::from_secs(61);
        assert!(limiter.check_at(A, later).await.is_ok());
    }

    #[tokio::test]
    async fn retry_after_counts_down() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();
        limiter.check_at(A, start).await.unwrap();
        let retry = limiter
            .check_at(A, start + Duration::from_secs(45))
            .await
            .unwrap_err();
        assert_eq!(retry, 15);
    }
}
