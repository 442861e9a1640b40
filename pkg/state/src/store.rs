use async_trait::async_trait;
use pkg_types::lease::{LeaseId, LeaseTimeToLive, Revision};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;

use crate::error::Result;

/// A key and its value as stored, with the revisions that created and last
/// modified it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
/// For deletes, `kv.value` is empty and `kv.mod_revision` is the delete revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub revision: Revision,
    pub event_type: EventType,
    pub kv: KeyValue,
}

/// Ordered change notifications for a prefix. The stream ends when the store
/// cancels the watch.
pub type WatchStream = Pin<Box<dyn Stream<Item = StoreEvent> + Send>>;

/// KV + Lease + Watch capability set of a linearizable store.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Lightweight probe of one endpoint; returns the current revision.
    async fn status(&self, endpoint: &str) -> Result<Revision>;

    /// Write `value` under `key`, optionally bound to `lease`.
    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<Revision>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All keys starting with `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Renew a lease once; returns the TTL it was reset to.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<i64>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// `None` when the lease has expired or never existed.
    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<LeaseTimeToLive>>;

    async fn leases(&self) -> Result<Vec<LeaseId>>;

    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
}

/// Everything needed to dial a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// The bare dial call: turns a [`DialConfig`] into a store handle.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, config: &DialConfig) -> Result<Arc<dyn CoordStore>>;
}
