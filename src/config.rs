//! Cache system configuration
//!
//! One explicit struct for everything the composition root needs. Values can
//! come from the environment via [`CacheConfig::from_env`]; either way they are
//! checked by [`CacheConfig::validate`] before anything is built.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{CacheError, CacheResult};
use crate::invalidation::DEFAULT_CHANNEL;

/// Which remote store backs the L2 tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Process-local store; no cross-process sharing
    #[default]
    Memory,
    /// Redis (requires the `redis` feature)
    Redis,
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown cache backend '{other}', expected 'memory' or 'redis'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: BackendKind,
    pub redis_url: String,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    /// Interval of the background L2 health monitor
    pub health_check_interval: Duration,
    /// Random fraction (0.0..=1.0) of the TTL added to L2 writes
    pub ttl_jitter: f64,
    /// Key namespace; `None` leaves keys unprefixed
    pub namespace: Option<String>,
    pub l1_max_size: usize,
    pub l1_default_ttl: Duration,
    /// TTL for L2 writes that do not specify one
    pub default_ttl: Duration,
    pub l1_backfill_ttl: Duration,
    pub sync_l1: bool,
    pub invalidation_channel: String,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            ttl_jitter: 0.0,
            namespace: None,
            l1_max_size: 1000,
            l1_default_ttl: Duration::from_secs(300),
            default_ttl: Duration::from_secs(3600),
            l1_backfill_ttl: Duration::from_secs(60),
            sync_l1: true,
            invalidation_channel: DEFAULT_CHANNEL.to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Parse an environment variable, warning and falling back on garbage
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "Ignoring unparsable environment variable");
            default
        }),
        Err(_) => default,
    }
}

impl CacheConfig {
    /// Load from environment variables, with defaults for anything unset
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `CACHE_BACKEND` | `backend` (`memory` / `redis`) |
    /// | `REDIS_URL` | `redis_url` |
    /// | `CACHE_CONNECT_TIMEOUT_MS` | `connect_timeout` |
    /// | `CACHE_SOCKET_TIMEOUT_MS` | `socket_timeout` |
    /// | `CACHE_HEALTH_CHECK_INTERVAL_SECS` | `health_check_interval` |
    /// | `CACHE_TTL_JITTER` | `ttl_jitter` |
    /// | `CACHE_NAMESPACE` | `namespace` |
    /// | `CACHE_L1_MAX_SIZE` | `l1_max_size` |
    /// | `CACHE_CIRCUIT_FAILURE_THRESHOLD` | `circuit_breaker.failure_threshold` |
    /// | `CACHE_CIRCUIT_TIMEOUT_SECS` | `circuit_breaker.timeout` |
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidConfig` for an unknown backend kind or when
    /// the loaded values fail [`validate`](Self::validate).
    pub fn from_env() -> CacheResult<Self> {
        let defaults = Self::default();

        let backend = match std::env::var("CACHE_BACKEND") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.backend,
        };

        let config = Self {
            backend,
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            connect_timeout: Duration::from_millis(env_parse(
                "CACHE_CONNECT_TIMEOUT_MS",
                u64::try_from(defaults.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            socket_timeout: Duration::from_millis(env_parse(
                "CACHE_SOCKET_TIMEOUT_MS",
                u64::try_from(defaults.socket_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            health_check_interval: Duration::from_secs(env_parse(
                "CACHE_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval.as_secs(),
            )),
            ttl_jitter: env_parse("CACHE_TTL_JITTER", defaults.ttl_jitter),
            namespace: std::env::var("CACHE_NAMESPACE").ok(),
            l1_max_size: env_parse("CACHE_L1_MAX_SIZE", defaults.l1_max_size),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env_parse(
                    "CACHE_CIRCUIT_FAILURE_THRESHOLD",
                    defaults.circuit_breaker.failure_threshold,
                ),
                timeout: Duration::from_secs(env_parse(
                    "CACHE_CIRCUIT_TIMEOUT_SECS",
                    defaults.circuit_breaker.timeout.as_secs(),
                )),
                ..defaults.circuit_breaker
            },
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work at runtime
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidNamespace` for a blank namespace and
    /// `CacheError::InvalidConfig` for any other out-of-range value.
    pub fn validate(&self) -> CacheResult<()> {
        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::InvalidConfig(format!(
                "ttl_jitter must be within 0.0..=1.0, got {}",
                self.ttl_jitter
            )));
        }
        if let Some(namespace) = &self.namespace {
            if namespace.trim().is_empty() {
                return Err(CacheError::InvalidNamespace(namespace.clone()));
            }
        }
        if self.l1_max_size == 0 {
            return Err(CacheError::InvalidConfig("l1_max_size must be at least 1".to_string()));
        }
        if self.invalidation_channel.is_empty() {
            return Err(CacheError::InvalidConfig(
                "invalidation_channel must not be empty".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.socket_timeout.is_zero() {
            return Err(CacheError::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if self.health_check_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "health_check_interval must be non-zero".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(CacheError::InvalidConfig(
                "circuit breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.backend == BackendKind::Redis && !cfg!(feature = "redis") {
            return Err(CacheError::InvalidConfig(
                "redis backend requested but the `redis` feature is disabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!(" Redis ".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert!("memcached".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        let jitter = CacheConfig {
            ttl_jitter: -0.1,
            ..CacheConfig::default()
        };
        assert!(matches!(jitter.validate(), Err(CacheError::InvalidConfig(_))));

        let namespace = CacheConfig {
            namespace: Some("   ".to_string()),
            ..CacheConfig::default()
        };
        assert!(matches!(namespace.validate(), Err(CacheError::InvalidNamespace(_))));

        let size = CacheConfig {
            l1_max_size: 0,
            ..CacheConfig::default()
        };
        assert!(size.validate().is_err());
    }
}
