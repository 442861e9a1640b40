//! Network-related constants.

/// Default consistent-store endpoints (a local three-member cluster).
pub const DEFAULT_ENDPOINTS: &[&str] = &["localhost:23791", "localhost:23792", "localhost:23793"];

/// Endpoint used by the development preset.
pub const DEVELOPMENT_ENDPOINT: &str = "localhost:2379";

/// Default dial timeout for the store connection, in milliseconds.
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;

/// Dial timeout used by the production preset, in milliseconds.
pub const PRODUCTION_DIAL_TIMEOUT_MS: u64 = 10_000;

/// Per-candidate dial timeout used by `GetConnection`, in milliseconds.
pub const DEFAULT_SERVICE_DIAL_TIMEOUT_MS: u64 = 5_000;

/// Load balancer name recorded on discovery options when none is given.
pub const DEFAULT_LOAD_BALANCER: &str = "round_robin";
