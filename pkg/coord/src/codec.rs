//! Key layout and value encoding of registrations and lock queues.

use pkg_types::lease::{LeaseId, lease_hex};
use pkg_types::service::{ServiceInstance, ServiceRecord};
use std::collections::HashMap;

/// `<prefix>/<service>/`, the range holding every instance of a service.
pub fn service_key_prefix(prefix: &str, service: &str) -> String {
    format!("{}/{}/", prefix, service)
}

/// `<prefix>/<service>/<instance>`
pub fn instance_key(prefix: &str, service: &str, instance_id: &str) -> String {
    format!("{}/{}/{}", prefix, service, instance_id)
}

/// `<prefix>/<key>/`, the range holding the contenders of one lock.
pub fn lock_key_prefix(prefix: &str, key: &str) -> String {
    format!("{}/{}/", prefix, key)
}

/// `<prefix>/<key>/<lease hex>`, one contender's queue entry.
pub fn lock_contender_key(prefix: &str, key: &str, lease: LeaseId) -> String {
    format!("{}/{}/{}", prefix, key, lease_hex(lease))
}

/// Instance id of a key directly under `service_prefix`. Deeper keys and the
/// prefix itself yield `None`.
pub fn instance_id_from_key<'a>(service_prefix: &str, key: &'a str) -> Option<&'a str> {
    let id = key.strip_prefix(service_prefix)?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Service name of an instance key under the registry root `prefix`.
pub fn service_name_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    let (service, id) = rest.split_once('/')?;
    (!service.is_empty() && !id.is_empty()).then_some(service)
}

pub fn encode_record(address: &str, metadata: &HashMap<String, String>) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&ServiceRecord {
        address: address.to_string(),
        metadata: metadata.clone(),
    })
}

/// Decode a stored registration. Older writers stored the bare address as
/// the value, so a non-JSON UTF-8 value is taken as the address.
pub fn decode_record(raw: &[u8]) -> Option<ServiceRecord> {
    let record = match serde_json::from_slice::<ServiceRecord>(raw) {
        Ok(record) => record,
        Err(_) => {
            let text = std::str::from_utf8(raw).ok()?.trim();
            if text.starts_with('{') || text.starts_with('[') || text.starts_with('"') {
                return None;
            }
            ServiceRecord {
                address: text.to_string(),
                metadata: HashMap::new(),
            }
        }
    };
    (!record.address.trim().is_empty()).then_some(record)
}

pub fn to_instance(
    service: &str,
    instance_id: &str,
    record: ServiceRecord,
    lease: Option<LeaseId>,
) -> ServiceInstance {
    ServiceInstance {
        service_name: service.to_string(),
        id: instance_id.to_string(),
        address: record.address,
        metadata: record.metadata,
        lease_id: lease,
    }
}
