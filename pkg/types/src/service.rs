use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::lease::LeaseId;

/// One running instance of a named service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub id: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Lease the registration key is bound to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<LeaseId>,
}

/// All instances registered under one service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub instances: Vec<ServiceInstance>,
}

/// Value stored under `<servicePrefix>/<serviceName>/<instanceID>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub address: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEventType {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for ServiceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceEventType::Add => write!(f, "ADD"),
            ServiceEventType::Update => write!(f, "UPDATE"),
            ServiceEventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A topology change observed on a watched service.
/// Delete events carry only the instance id; the value is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: ServiceEventType,
    pub service: String,
    pub instance: ServiceInstance,
}
