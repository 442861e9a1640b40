use pkg_constants::coord::{RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};
use pkg_state::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Broad classification of a [`CoordError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Registry,
    Discovery,
    Lock,
    Lease,
    Configuration,
    Timeout,
    NotFound,
    InvalidState,
    Canceled,
}

impl ErrorKind {
    /// Code used when an error of this kind wraps a lower-level cause.
    pub fn base_code(self) -> u32 {
        match self {
            ErrorKind::Connection => 1000,
            ErrorKind::Registry => 2000,
            ErrorKind::Discovery => 3000,
            ErrorKind::Lock => 4000,
            ErrorKind::Lease => 5000,
            ErrorKind::Configuration => 6000,
            ErrorKind::Timeout
            | ErrorKind::NotFound
            | ErrorKind::InvalidState
            | ErrorKind::Canceled => 7000,
        }
    }

    fn from_code(code: u32) -> Self {
        match code {
            1000..=1999 => ErrorKind::Connection,
            2000..=2999 => ErrorKind::Registry,
            3000..=3999 => ErrorKind::Discovery,
            4000..=4999 => ErrorKind::Lock,
            5000..=5999 => ErrorKind::Lease,
            6000..=6999 => ErrorKind::Configuration,
            codes::NOT_FOUND => ErrorKind::NotFound,
            codes::INVALID_STATE => ErrorKind::InvalidState,
            codes::CANCELED => ErrorKind::Canceled,
            _ => ErrorKind::Timeout,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Registry => "registry",
            ErrorKind::Discovery => "discovery",
            ErrorKind::Lock => "lock",
            ErrorKind::Lease => "lease",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Numeric error codes. The thousands digit selects the [`ErrorKind`].
pub mod codes {
    pub const CONNECTION_FAILED: u32 = 1001;
    pub const CONNECTION_LOST: u32 = 1002;
    pub const CONNECTION_TIMEOUT: u32 = 1003;
    pub const NOT_CONNECTED: u32 = 1004;

    pub const ALREADY_REGISTERED: u32 = 2001;
    pub const NOT_REGISTERED: u32 = 2002;
    pub const REGISTRATION_FAILED: u32 = 2003;
    pub const DEREGISTRATION_FAILED: u32 = 2004;

    pub const SERVICE_NOT_FOUND: u32 = 3001;
    pub const NO_AVAILABLE_INSTANCES: u32 = 3002;
    pub const DISCOVERY_FAILED: u32 = 3003;

    pub const LOCK_ACQUISITION_FAILED: u32 = 4001;
    pub const LOCK_NOT_HELD: u32 = 4002;
    pub const LOCK_ALREADY_HELD: u32 = 4003;
    pub const LOCK_ACQUISITION_TIMEOUT: u32 = 4004;

    pub const LEASE_CREATION_FAILED: u32 = 5001;
    pub const LEASE_NOT_FOUND: u32 = 5002;
    pub const LEASE_EXPIRED: u32 = 5003;
    pub const LEASE_REVOKE_FAILED: u32 = 5004;

    pub const INVALID_CONFIGURATION: u32 = 6001;
    pub const MISSING_ENDPOINTS: u32 = 6002;
    pub const INVALID_TIMEOUT: u32 = 6003;

    pub const TIMEOUT: u32 = 7001;
    pub const NOT_FOUND: u32 = 7002;
    pub const INVALID_STATE: u32 = 7003;
    pub const CANCELED: u32 = 7004;
}

/// Error returned by every coordination operation.
///
/// Carries a kind and a numeric code so callers can classify it without
/// matching on the message. Store failures are kept as the `source`.
#[derive(Debug, Error)]
#[error("[{kind}:{code}] {message}")]
pub struct CoordError {
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, CoordError>;

impl CoordError {
    /// Error with a predefined code; the kind is derived from the code.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_code(code),
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Error with a predefined code wrapping a lower-level cause.
    pub fn wrap<E>(code: u32, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(code, message).with_source(source)
    }

    /// Wrap a cause under a kind's base code.
    pub fn wrap_kind<E>(kind: ErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            code: kind.base_code(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn canceled() -> Self {
        Self::new(codes::CANCELED, "operation canceled")
    }

    pub fn is(&self, kind: ErrorKind, code: u32) -> bool {
        self.kind == kind && self.code == code
    }

    pub fn is_connection(&self) -> bool {
        self.kind == ErrorKind::Connection
    }

    pub fn is_registry(&self) -> bool {
        self.kind == ErrorKind::Registry
    }

    pub fn is_discovery(&self) -> bool {
        self.kind == ErrorKind::Discovery
    }

    pub fn is_lock(&self) -> bool {
        self.kind == ErrorKind::Lock
    }

    pub fn is_lease(&self) -> bool {
        self.kind == ErrorKind::Lease
    }

    pub fn is_configuration(&self) -> bool {
        self.kind == ErrorKind::Configuration
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    /// Whether retrying the operation may succeed: connection and timeout
    /// failures, or any error caused by an unreachable store.
    pub fn is_retryable(&self) -> bool {
        if matches!(self.kind, ErrorKind::Connection | ErrorKind::Timeout) {
            return true;
        }
        if matches!(
            self.code,
            codes::CONNECTION_LOST | codes::CONNECTION_TIMEOUT | codes::TIMEOUT
        ) {
            return true;
        }
        let mut cause = self.source.as_deref().map(|s| s as &(dyn std::error::Error + 'static));
        while let Some(err) = cause {
            if let Some(store) = err.downcast_ref::<StoreError>() {
                if store.is_unavailable() {
                    return true;
                }
            }
            if let Some(inner) = err.downcast_ref::<CoordError>() {
                if inner.is_retryable() {
                    return true;
                }
            }
            cause = err.source();
        }
        false
    }
}

/// Capped exponential backoff: 100ms, 200ms, 400ms ... up to 3200ms.
pub fn retry_delay(attempt: u32) -> Duration {
    backoff(
        attempt,
        Duration::from_millis(RETRY_BASE_DELAY_MS),
        Duration::from_millis(RETRY_MAX_DELAY_MS),
    )
}

pub(crate) fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Wrap a store failure under `code`, keeping it as the source.
pub(crate) fn store_err(code: u32, message: impl Into<String>) -> impl FnOnce(StoreError) -> CoordError {
    let message = message.into();
    move |e| CoordError::wrap(code, message, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_kind_follows_code() {
        assert_eq!(
            CoordError::new(codes::SERVICE_NOT_FOUND, "x").kind,
            ErrorKind::Discovery
        );
        assert_eq!(
            CoordError::new(codes::LOCK_ALREADY_HELD, "x").kind,
            ErrorKind::Lock
        );
        assert_eq!(CoordError::new(codes::TIMEOUT, "x").kind, ErrorKind::Timeout);
        assert_eq!(CoordError::new(codes::CANCELED, "x").kind, ErrorKind::Canceled);
        assert_eq!(
            CoordError::new(codes::INVALID_STATE, "x").kind,
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_display_and_source() {
        let err = CoordError::wrap(
            codes::REGISTRATION_FAILED,
            "failed to write registration",
            StoreError::Unavailable("down".into()),
        );
        assert_eq!(
            err.to_string(),
            "[registry:2003] failed to write registration"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoordError::new(codes::CONNECTION_FAILED, "x").is_retryable());
        assert!(CoordError::new(codes::TIMEOUT, "x").is_retryable());
        assert!(!CoordError::new(codes::LOCK_ALREADY_HELD, "x").is_retryable());
        assert!(!CoordError::new(codes::ALREADY_REGISTERED, "x").is_retryable());

        let wrapped = CoordError::wrap_kind(
            ErrorKind::Lock,
            "lock failed",
            StoreError::Unavailable("partition".into()),
        );
        assert_eq!(wrapped.code, 4000);
        assert!(wrapped.is_retryable());

        let lease_gone = CoordError::wrap(
            codes::LEASE_NOT_FOUND,
            "gone",
            StoreError::LeaseNotFound(7),
        );
        assert!(!lease_gone.is_retryable());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay(0), Duration::from_millis(100));
        assert_eq!(retry_delay(1), Duration::from_millis(200));
        assert_eq!(retry_delay(5), Duration::from_millis(3200));
        assert_eq!(retry_delay(6), Duration::from_millis(3200));
        assert_eq!(retry_delay(64), Duration::from_millis(3200));
    }
}
