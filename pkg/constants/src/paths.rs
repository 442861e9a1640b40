//! Filesystem path constants.

/// Default config file path for `coordctl`.
pub const DEFAULT_CONFIG: &str = "/etc/coord/config.yaml";

/// Default data directory for the embedded SlateDB-backed store.
pub const DEFAULT_DATA_DIR: &str = "/tmp/coord-data";
