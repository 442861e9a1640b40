//! Embedded store constants.

/// Number of events a watcher may fall behind before its stream is cancelled.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// How often the embedded store sweeps for expired leases, in milliseconds.
pub const LEASE_REAPER_INTERVAL_MS: u64 = 250;

/// First lease identifier handed out by a fresh store.
pub const FIRST_LEASE_ID: i64 = 0x1000;
