//! Coordination client constants: key layout, lease timing, retry policy.

/// Key prefix under which service instances are registered.
pub const DEFAULT_SERVICE_PREFIX: &str = "/services";

/// Key prefix under which lock contenders are queued.
pub const DEFAULT_LOCK_PREFIX: &str = "/locks";

/// Lease TTL used when a registration does not specify one, in seconds.
pub const DEFAULT_TTL_SECS: i64 = 30;

/// Lease TTL used by the development preset, in seconds.
pub const DEVELOPMENT_TTL_SECS: i64 = 10;

/// A keepalive is sent every `TTL / KEEPALIVE_INTERVAL_DIVISOR`.
pub const KEEPALIVE_INTERVAL_DIVISOR: u32 = 3;

/// Lower bound on the keepalive interval, in milliseconds.
pub const MIN_KEEPALIVE_INTERVAL_MS: u64 = 100;

/// Capacity of the keepalive acknowledgement channel.
pub const KEEPALIVE_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the channel returned by `WatchService`.
pub const WATCH_EVENT_BUFFER: usize = 10;

/// How long `TryLock` waits on the sequenced mutex before reporting contention, in milliseconds.
pub const TRY_LOCK_TIMEOUT_MS: u64 = 100;

/// Default interval of the orchestrator health-check loop, in milliseconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

/// Default timeout of a single health check, in milliseconds.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;

/// Base delay of the retry backoff, in milliseconds.
pub const RETRY_BASE_DELAY_MS: u64 = 100;

/// Ceiling of the retry backoff, in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 3_200;

/// Default maximum number of retries recorded in the retry config.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Largest lease TTL accepted, in seconds.
pub const MAX_LEASE_TTL_SECS: i64 = 9_000_000_000;
