use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque lease identifier handed out by the store.
pub type LeaseId = i64;

/// Store-wide modification counter.
pub type Revision = i64;

/// Store-side view of a lease, as returned by a time-to-live query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTimeToLive {
    pub id: LeaseId,
    /// TTL the lease was granted with, in seconds.
    pub granted_ttl: i64,
    /// Seconds left before the lease expires.
    pub ttl: i64,
    /// Keys currently bound to the lease.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Client-side record of a lease tracked by the lease manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub id: LeaseId,
    pub ttl_seconds: i64,
    pub granted_at: DateTime<Utc>,
    /// Whether a heartbeat loop is currently renewing this lease.
    pub keepalive: bool,
}

/// Format a lease id the way it appears inside store keys.
pub fn lease_hex(id: LeaseId) -> String {
    format!("{:x}", id)
}
