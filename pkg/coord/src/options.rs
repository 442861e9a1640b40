use pkg_constants::coord::{
    DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_HEALTH_CHECK_TIMEOUT_MS, DEFAULT_LOCK_PREFIX,
    DEFAULT_MAX_RETRIES, DEFAULT_SERVICE_PREFIX, DEFAULT_TTL_SECS, DEVELOPMENT_TTL_SECS,
    MAX_LEASE_TTL_SECS, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, TRY_LOCK_TIMEOUT_MS,
};
use pkg_constants::network::{
    DEFAULT_DIAL_TIMEOUT_MS, DEFAULT_ENDPOINTS, DEFAULT_LOAD_BALANCER,
    DEFAULT_SERVICE_DIAL_TIMEOUT_MS, DEVELOPMENT_ENDPOINT, PRODUCTION_DIAL_TIMEOUT_MS,
};
use pkg_state::DialConfig;
use pkg_types::config::CoordConfigFile;
use pkg_types::lease::LeaseId;
use pkg_types::validate::validate_prefix;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CoordError, Result, backoff, codes};

/// Backoff policy shared by the health supervisor and the resubscribing watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff(attempt, self.base_delay, self.max_delay)
    }
}

/// Configuration of a [`CoordManager`](crate::manager::CoordManager).
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Lease TTL in seconds for registrations and locks that don't pass one.
    pub default_ttl: i64,
    pub service_prefix: String,
    pub lock_prefix: String,
    /// Merged under the metadata of every registration.
    pub default_metadata: HashMap<String, String>,
    /// Zero disables the health-check loop.
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub retry: RetryConfig,
    pub try_lock_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
            username: None,
            password: None,
            default_ttl: DEFAULT_TTL_SECS,
            service_prefix: DEFAULT_SERVICE_PREFIX.to_string(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            default_metadata: HashMap::new(),
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            health_check_timeout: Duration::from_millis(DEFAULT_HEALTH_CHECK_TIMEOUT_MS),
            retry: RetryConfig::default(),
            try_lock_timeout: Duration::from_millis(TRY_LOCK_TIMEOUT_MS),
        }
    }
}

impl ManagerOptions {
    /// Single local endpoint and a short TTL.
    pub fn development() -> Self {
        Self {
            endpoints: vec![DEVELOPMENT_ENDPOINT.to_string()],
            default_ttl: DEVELOPMENT_TTL_SECS,
            ..Self::default()
        }
    }

    /// Longer dial timeout for real clusters.
    pub fn production(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            dial_timeout: Duration::from_millis(PRODUCTION_DIAL_TIMEOUT_MS),
            ..Self::default()
        }
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// Check the options, normalizing a non-positive TTL to the default.
    pub fn validate(&mut self) -> Result<()> {
        if self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(CoordError::new(
                codes::MISSING_ENDPOINTS,
                "at least one non-empty endpoint is required",
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(CoordError::new(
                codes::INVALID_TIMEOUT,
                "dial timeout must be positive",
            ));
        }
        if self.default_ttl <= 0 {
            self.default_ttl = DEFAULT_TTL_SECS;
        }
        if self.default_ttl > MAX_LEASE_TTL_SECS {
            return Err(CoordError::new(
                codes::INVALID_CONFIGURATION,
                format!("default TTL must not exceed {} seconds", MAX_LEASE_TTL_SECS),
            ));
        }
        if self.health_check_timeout.is_zero() {
            self.health_check_timeout = Duration::from_millis(DEFAULT_HEALTH_CHECK_TIMEOUT_MS);
        }
        if self.try_lock_timeout.is_zero() {
            self.try_lock_timeout = Duration::from_millis(TRY_LOCK_TIMEOUT_MS);
        }
        for (what, prefix) in [
            ("service prefix", &self.service_prefix),
            ("lock prefix", &self.lock_prefix),
        ] {
            validate_prefix(what, prefix)
                .map_err(|e| CoordError::new(codes::INVALID_CONFIGURATION, e.to_string()))?;
        }
        if self.service_prefix == self.lock_prefix {
            return Err(CoordError::new(
                codes::INVALID_CONFIGURATION,
                "service prefix and lock prefix must differ",
            ));
        }
        Ok(())
    }

    /// Apply every field set in `file` on top of these options.
    pub fn merge_file(&mut self, file: &CoordConfigFile) {
        if let Some(endpoints) = &file.endpoints {
            self.endpoints = endpoints.clone();
        }
        if let Some(ms) = file.dial_timeout_ms {
            self.dial_timeout = Duration::from_millis(ms);
        }
        if file.username.is_some() {
            self.username = file.username.clone();
        }
        if file.password.is_some() {
            self.password = file.password.clone();
        }
        if let Some(ttl) = file.default_ttl {
            self.default_ttl = ttl;
        }
        if let Some(prefix) = &file.service_prefix {
            self.service_prefix = prefix.clone();
        }
        if let Some(prefix) = &file.lock_prefix {
            self.lock_prefix = prefix.clone();
        }
        if let Some(metadata) = &file.default_metadata {
            self.default_metadata.extend(metadata.clone());
        }
        if let Some(ms) = file.health_check_interval_ms {
            self.health_check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.health_check_timeout_ms {
            self.health_check_timeout = Duration::from_millis(ms);
        }
    }

    /// Whether switching to `other` requires a new connection.
    pub fn connection_changed(&self, other: &ManagerOptions) -> bool {
        self.endpoints != other.endpoints
            || self.dial_timeout != other.dial_timeout
            || self.username != other.username
            || self.password != other.password
    }

    pub fn dial_config(&self) -> DialConfig {
        DialConfig {
            endpoints: self.endpoints.clone(),
            dial_timeout: self.dial_timeout,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Fluent construction of [`ManagerOptions`].
#[derive(Debug, Default)]
pub struct ManagerBuilder {
    options: ManagerOptions,
}

impl ManagerBuilder {
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.options.dial_timeout = timeout;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.username = Some(username.into());
        self.options.password = Some(password.into());
        self
    }

    pub fn with_default_ttl(mut self, ttl_secs: i64) -> Self {
        self.options.default_ttl = ttl_secs;
        self
    }

    pub fn with_service_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.service_prefix = prefix.into();
        self
    }

    pub fn with_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.lock_prefix = prefix.into();
        self
    }

    pub fn with_default_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.options.default_metadata = metadata;
        self
    }

    pub fn with_health_check(mut self, interval: Duration, timeout: Duration) -> Self {
        self.options.health_check_interval = interval;
        self.options.health_check_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn with_try_lock_timeout(mut self, timeout: Duration) -> Self {
        self.options.try_lock_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ManagerOptions> {
        let mut options = self.options;
        options.validate()?;
        Ok(options)
    }
}

/// Per-call overrides for `Register`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterOptions {
    /// Lease TTL in seconds; the manager default when unset.
    pub ttl: Option<i64>,
    pub metadata: HashMap<String, String>,
    /// Bind to an existing caller-owned lease instead of creating one.
    pub lease_id: Option<LeaseId>,
}

impl RegisterOptions {
    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease_id = Some(lease);
        self
    }
}

/// Per-call options for resolving and dialing a service.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryOptions {
    /// Dial bound applied to each candidate.
    pub timeout: Duration,
    /// Only instances carrying every one of these pairs are candidates.
    pub metadata: HashMap<String, String>,
    pub load_balancer: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_SERVICE_DIAL_TIMEOUT_MS),
            metadata: HashMap::new(),
            load_balancer: DEFAULT_LOAD_BALANCER.to_string(),
        }
    }
}

impl DiscoveryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut options = ManagerOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.endpoints.len(), 3);
        assert_eq!(options.service_prefix, "/services");
    }

    #[test]
    fn test_presets() {
        let dev = ManagerOptions::development();
        assert_eq!(dev.endpoints, vec!["localhost:2379".to_string()]);
        assert_eq!(dev.default_ttl, 10);

        let prod = ManagerOptions::production(vec!["10.0.0.1:2379".into()]);
        assert_eq!(prod.dial_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validation_codes() {
        let err = ManagerOptions::builder()
            .with_endpoints(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert_eq!(err.code, codes::MISSING_ENDPOINTS);

        let err = ManagerOptions::builder()
            .with_dial_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_TIMEOUT);

        let err = ManagerOptions::builder()
            .with_service_prefix("/services/")
            .build()
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_CONFIGURATION);

        let err = ManagerOptions::builder()
            .with_lock_prefix("locks")
            .build()
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_CONFIGURATION);

        let err = ManagerOptions::builder()
            .with_default_ttl(i64::MAX)
            .build()
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_CONFIGURATION);
    }

    #[test]
    fn test_non_positive_ttl_is_normalized() {
        let options = ManagerOptions::builder()
            .with_default_ttl(-5)
            .build()
            .unwrap();
        assert_eq!(options.default_ttl, DEFAULT_TTL_SECS);
    }

    #[test]
    fn test_merge_file_overrides_only_set_fields() {
        let mut options = ManagerOptions::default();
        let file = CoordConfigFile {
            endpoints: Some(vec!["x:1".into()]),
            default_ttl: Some(7),
            default_metadata: Some(HashMap::from([("zone".into(), "b".into())])),
            ..Default::default()
        };
        options.merge_file(&file);
        assert_eq!(options.endpoints, vec!["x:1".to_string()]);
        assert_eq!(options.default_ttl, 7);
        assert_eq!(options.lock_prefix, "/locks");
        assert_eq!(options.default_metadata.get("zone").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_connection_changed() {
        let base = ManagerOptions::default();
        let mut other = base.clone();
        other.default_ttl = 99;
        other.health_check_interval = Duration::ZERO;
        assert!(!base.connection_changed(&other));

        other.username = Some("root".into());
        assert!(base.connection_changed(&other));
    }

    #[test]
    fn test_retry_config_delay() {
        let retry = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        assert_eq!(retry.delay(0), Duration::from_millis(10));
        assert_eq!(retry.delay(2), Duration::from_millis(40));
        assert_eq!(retry.delay(3), Duration::from_millis(50));
    }
}
