use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Coordination client configuration file (YAML or JSON).
///
/// Example `config.yaml`:
/// ```yaml
/// endpoints:
///   - 10.0.0.1:2379
///   - 10.0.0.2:2379
/// dial-timeout-ms: 5000
/// default-ttl: 30
/// service-prefix: /services
/// lock-prefix: /locks
/// health-check-interval-ms: 30000
/// data-dir: /var/lib/coord
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordConfigFile {
    #[serde(default)]
    pub endpoints: Option<Vec<String>>,
    #[serde(default, alias = "dial-timeout-ms")]
    pub dial_timeout_ms: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "default-ttl")]
    pub default_ttl: Option<i64>,
    #[serde(default, alias = "service-prefix")]
    pub service_prefix: Option<String>,
    #[serde(default, alias = "lock-prefix")]
    pub lock_prefix: Option<String>,
    #[serde(default, alias = "default-metadata")]
    pub default_metadata: Option<HashMap<String, String>>,
    #[serde(default, alias = "health-check-interval-ms")]
    pub health_check_interval_ms: Option<u64>,
    #[serde(default, alias = "health-check-timeout-ms")]
    pub health_check_timeout_ms: Option<u64>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
}

/// Load a YAML or JSON config file (by extension), returning the default if
/// the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let is_json = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config: T = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(config)
}
