//! Per-IP rate limiting for the combiner's public endpoints.
//!
//! This is transport-level abuse protection only. Domain quotas are
//! enforced by the signers and are unaffected by this limiter.
//!
//! Uses actix-governor with the built-in PeerIpKeyExtractor.

use actix_governor::{GovernorConfig, GovernorConfigBuilder, PeerIpKeyExtractor};

use crate::config::Settings;
use crate::error::{OdisError, OdisResult};

/// Per-IP request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Sustained rate: one request replenished every this many seconds.
    pub seconds_per_request: u64,
    /// Requests allowed in a burst.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            seconds_per_request: 1,
            burst: 50,
        }
    }
}

impl RateLimitConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            seconds_per_request: settings.rate_limit_seconds_per_request(),
            burst: settings.rate_limit_burst(),
        }
    }
}

/// Limiter configuration shared by every worker.
///
/// Cloning keeps the underlying limiter state, so each worker can build its
/// own `Governor` while all of them draw from the same per-IP budget.
pub type RateLimiterConfig = GovernorConfig<PeerIpKeyExtractor, governor::middleware::NoOpMiddleware>;

/// Build the limiter configuration wrapping every combiner route.
pub fn general_limiter(config: &RateLimitConfig) -> OdisResult<RateLimiterConfig> {
    GovernorConfigBuilder::default()
        .seconds_per_request(config.seconds_per_request.max(1))
        .burst_size(config.burst.max(1))
        .finish()
        .ok_or_else(|| OdisError::Config("invalid rate limiter configuration".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.seconds_per_request, 1);
        assert_eq!(config.burst, 50);
    }

    #[test]
    fn test_limiter_creation() {
        assert!(general_limiter(&RateLimitConfig::default()).is_ok());

        // Zero values are clamped rather than rejected
        let zeroed = RateLimitConfig {
            seconds_per_request: 0,
            burst: 0,
        };
        assert!(general_limiter(&zeroed).is_ok());
    }

    #[test]
    fn test_shared_config() {
        let config = general_limiter(&RateLimitConfig::default()).unwrap();

        // One governor per worker, all backed by the same config
        let _gov1 = actix_governor::Governor::new(&config);
        let _gov2 = actix_governor::Governor::new(&config.clone());
    }

    #[test]
    fn test_from_settings() {
        let settings = Settings::for_combiner_tests();
        let config = RateLimitConfig::from_settings(&settings);
        assert_eq!(config.burst, settings.rate_limit_burst());
    }
}
