//! Rate limiting for flood protection.
//!
//! Provides governor-based rate limiting for:
//! - Frame rate per connection
//! - Connection rate per IP
//!
//! Each limiter type has its own storage so a noisy connection never eats
//! into the connect budget of its address.

use crate::config::LimitsConfig;
use crate::state::ConnectionHandle;
use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovRateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use tracing::debug;

/// Type alias for governor's direct rate limiter.
type DirectRateLimiter = governor::DefaultDirectRateLimiter;

/// Entries kept per map before [`RateLimitManager::cleanup`] starts over.
const MAX_ENTRIES: usize = 10_000;

/// Thread-safe rate limit manager using governor.
#[derive(Debug)]
pub struct RateLimitManager {
    /// Per-connection frame rate limiters.
    message_limiters: DashMap<ConnectionHandle, DirectRateLimiter>,
    /// Per-IP connection rate limiters.
    connection_limiters: DashMap<IpAddr, DirectRateLimiter>,
    message_rate: NonZeroU32,
    connection_burst: NonZeroU32,
}

impl RateLimitManager {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            message_limiters: DashMap::new(),
            connection_limiters: DashMap::new(),
            message_rate: NonZeroU32::new(limits.message_rate_per_second)
                .unwrap_or(NonZeroU32::MIN),
            connection_burst: NonZeroU32::new(limits.connection_burst_per_ip)
                .unwrap_or(NonZeroU32::MIN),
        }
    }

    /// Check if a connection can send another frame.
    ///
    /// Returns `true` if allowed, `false` if rate limited.
    pub fn check_message_rate(&self, handle: ConnectionHandle) -> bool {
        let limiter = self
            .message_limiters
            .entry(handle)
            .or_insert_with(|| GovRateLimiter::direct(Quota::per_second(self.message_rate)));

        let allowed = limiter.check().is_ok();
        if !allowed {
            debug!(%handle, "message rate limit exceeded");
        }
        allowed
    }

    /// Check if an IP can open a new connection.
    ///
    /// One connection per second sustained, with a configurable burst.
    pub fn check_connection_rate(&self, ip: IpAddr) -> bool {
        let limiter = self.connection_limiters.entry(ip).or_insert_with(|| {
            GovRateLimiter::direct(
                Quota::per_second(NonZeroU32::MIN).allow_burst(self.connection_burst),
            )
        });

        let allowed = limiter.check().is_ok();
        if !allowed {
            debug!(%ip, "connection rate limit exceeded");
        }
        allowed
    }

    /// Forget a connection's limiter (on disconnect).
    pub fn remove_client(&self, handle: ConnectionHandle) {
        self.message_limiters.remove(&handle);
    }

    /// Drop every limiter of a kind once it grows past a fixed size.
    ///
    /// Called periodically from a maintenance task.
    pub fn cleanup(&self) {
        if self.message_limiters.len() > MAX_ENTRIES {
            self.message_limiters.clear();
            debug!("cleared message rate limiters (exceeded {} entries)", MAX_ENTRIES);
        }
        if self.connection_limiters.len() > MAX_ENTRIES {
            self.connection_limiters.clear();
            debug!("cleared connection rate limiters (exceeded {} entries)", MAX_ENTRIES);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> (usize, usize) {
        (self.message_limiters.len(), self.connection_limiters.len())
    }
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limits(rate: u32, burst: u32) -> LimitsConfig {
        LimitsConfig {
            message_rate_per_second: rate,
            connection_burst_per_ip: burst,
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn test_message_rate_allows_burst_then_limits() {
        let manager = RateLimitManager::new(&limits(5, 10));
        let handle = ConnectionHandle::generate();

        for _ in 0..5 {
            assert!(manager.check_message_rate(handle));
        }
        assert!(!manager.check_message_rate(handle));
    }

    #[test]
    fn test_connections_limited_per_ip() {
        let manager = RateLimitManager::new(&limits(5, 3));
        let noisy = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let quiet = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));

        for _ in 0..3 {
            assert!(manager.check_connection_rate(noisy));
        }
        assert!(!manager.check_connection_rate(noisy));
        assert!(manager.check_connection_rate(quiet));
    }

    #[test]
    fn test_zero_config_falls_back_to_one() {
        let manager = RateLimitManager::new(&limits(0, 0));
        let handle = ConnectionHandle::generate();
        assert!(manager.check_message_rate(handle));
        assert!(!manager.check_message_rate(handle));
    }

    #[test]
    fn test_remove_client_resets_budget() {
        let manager = RateLimitManager::new(&limits(1, 1));
        let handle = ConnectionHandle::generate();
        assert!(manager.check_message_rate(handle));
        assert!(!manager.check_message_rate(handle));

        manager.remove_client(handle);
        assert_eq!(manager.tracked().0, 0);
        assert!(manager.check_message_rate(handle));
    }

    #[test]
    fn test_cleanup_keeps_small_maps() {
        let manager = RateLimitManager::default();
        manager.check_message_rate(ConnectionHandle::generate());
        manager.check_connection_rate(IpAddr::V4(Ipv4Addr::LOCALHOST));
        manager.cleanup();
        assert_eq!(manager.tracked(), (1, 1));
    }
}
