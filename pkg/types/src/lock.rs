use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::LeaseId;

/// Details of a lock held by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub key: String,
    pub owner: String,
    pub lease_id: LeaseId,
    /// Seconds left on the bound lease at the time of the query.
    pub ttl_seconds: i64,
    pub acquired_at: DateTime<Utc>,
}
