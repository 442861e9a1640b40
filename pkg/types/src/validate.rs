use anyhow::{Result, bail};

/// Longest accepted name segment.
const MAX_SEGMENT_LEN: usize = 253;

/// Validate one segment of a store key (service name, instance id, lock key).
/// Rules: non-empty, at most 253 chars, no `/`, no whitespace or control characters.
pub fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{} must not be empty", what);
    }
    if value.len() > MAX_SEGMENT_LEN {
        bail!(
            "{} '{}' exceeds {} characters (got {})",
            what,
            value,
            MAX_SEGMENT_LEN,
            value.len()
        );
    }
    if value.contains('/') {
        bail!("{} '{}' must not contain '/'", what, value);
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("{} '{}' must not contain whitespace", what, value);
    }
    Ok(())
}

/// Validate a key prefix: must start with `/` and must not end with `/`.
pub fn validate_prefix(what: &str, prefix: &str) -> Result<()> {
    if !prefix.starts_with('/') {
        bail!("{} '{}' must start with '/'", what, prefix);
    }
    if prefix.len() > 1 && prefix.ends_with('/') {
        bail!("{} '{}' must not end with '/'", what, prefix);
    }
    if prefix == "/" {
        bail!("{} must not be the root '/'", what);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_segments() {
        assert!(validate_segment("service name", "user-api").is_ok());
        assert!(validate_segment("instance id", "node-1:8080").is_ok());
        assert!(validate_segment("lock key", "order.42").is_ok());
        assert!(validate_segment("lock key", "库存").is_ok());
    }

    #[test]
    fn invalid_segments() {
        assert!(validate_segment("service name", "").is_err());
        assert!(validate_segment("service name", "a/b").is_err());
        assert!(validate_segment("service name", "has space").is_err());
        assert!(validate_segment("service name", "tab\there").is_err());
        assert!(validate_segment("service name", &"a".repeat(254)).is_err());
    }

    #[test]
    fn prefixes() {
        assert!(validate_prefix("service prefix", "/services").is_ok());
        assert!(validate_prefix("service prefix", "/a/b").is_ok());
        assert!(validate_prefix("service prefix", "services").is_err());
        assert!(validate_prefix("service prefix", "/services/").is_err());
        assert!(validate_prefix("service prefix", "/").is_err());
    }
}
