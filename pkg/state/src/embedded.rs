use async_trait::async_trait;
use pkg_constants::state::{FIRST_LEASE_ID, LEASE_REAPER_INTERVAL_MS, WATCH_CHANNEL_CAPACITY};
use pkg_types::lease::{LeaseId, LeaseTimeToLive, Revision, lease_hex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{KvBackend, MemoryBackend};
use crate::error::{Result, StoreError};
use crate::store::{
    CoordStore, DialConfig, EventType, KeyValue, StoreConnector, StoreEvent, WatchStream,
};
use crate::watch::EventLog;

/// On-disk representation of one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    value: Vec<u8>,
    create_revision: Revision,
    mod_revision: Revision,
    #[serde(default)]
    lease: Option<LeaseId>,
}

struct LeaseEntry {
    granted_ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Inner {
    revision: Revision,
    next_lease: LeaseId,
    leases: HashMap<LeaseId, LeaseEntry>,
}

/// Single-node store implementing [`CoordStore`] on top of a [`KvBackend`].
///
/// Every operation runs under one async mutex, which makes reads and writes
/// linearizable and keeps watch events in apply order. Leases are held in
/// memory: they never outlive the process, so keys bound to a lease are purged
/// when a persisted store is reopened.
pub struct EmbeddedStore {
    backend: Arc<dyn KvBackend>,
    inner: Mutex<Inner>,
    events: EventLog,
    available: AtomicBool,
    down_endpoints: RwLock<HashSet<String>>,
}

impl EmbeddedStore {
    /// Open a store over `backend` and start its lease reaper.
    pub async fn open(backend: Arc<dyn KvBackend>) -> Result<Arc<Self>> {
        let mut revision = 0;
        let mut purged = 0usize;
        for (key, raw) in backend.list_prefix("").await? {
            let record: StoredRecord = match serde_json::from_slice(&raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            revision = revision.max(record.mod_revision);
            if record.lease.is_some() {
                backend.delete(&key).await?;
                purged += 1;
            }
        }
        info!(revision, purged, "Embedded store opened");

        let store = Arc::new(Self {
            backend,
            inner: Mutex::new(Inner {
                revision,
                next_lease: FIRST_LEASE_ID,
                leases: HashMap::new(),
            }),
            events: EventLog::new(WATCH_CHANNEL_CAPACITY),
            available: AtomicBool::new(true),
            down_endpoints: RwLock::new(HashSet::new()),
        });
        Self::spawn_reaper(Arc::downgrade(&store));
        Ok(store)
    }

    /// Open a volatile store.
    pub async fn in_memory() -> Result<Arc<Self>> {
        Self::open(Arc::new(MemoryBackend::new())).await
    }

    /// Simulate a partition: while unavailable every call fails and every
    /// open watch stream is ended. Leases keep expiring store-side.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            info!("Embedded store available");
        } else {
            warn!("Embedded store unavailable, cancelling watchers");
            self.events.close_all();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Make status probes of one endpoint fail.
    pub fn set_endpoint_down(&self, endpoint: &str, down: bool) {
        let mut set = self.down_endpoints.write().unwrap_or_else(|e| e.into_inner());
        if down {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Current revision.
    pub async fn revision(&self) -> Revision {
        self.inner.lock().await.revision
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        self.events.watcher_count()
    }

    fn spawn_reaper(store: Weak<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(LEASE_REAPER_INTERVAL_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let mut inner = store.inner.lock().await;
                if let Err(e) = store.expire_leases(&mut inner).await {
                    warn!(error = %e, "Lease reaper pass failed");
                }
            }
        });
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is unreachable".to_string()))
        }
    }

    /// Lock the state and drop every lease whose deadline has passed.
    async fn lock_fresh(&self) -> Result<tokio::sync::MutexGuard<'_, Inner>> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;
        self.expire_leases(&mut inner).await?;
        Ok(inner)
    }

    async fn expire_leases(&self, inner: &mut Inner) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = inner.leases.remove(&id) {
                debug!(lease = %lease_hex(id), keys = lease.keys.len(), "Lease expired");
                for key in lease.keys {
                    self.delete_locked(inner, &key).await?;
                }
            }
        }
        Ok(())
    }

    async fn read_record(&self, key: &str) -> Result<Option<StoredRecord>> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_locked(
        &self,
        inner: &mut Inner,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<Revision> {
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("empty key".to_string()));
        }
        if let Some(id) = lease {
            if !inner.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        let previous = self.read_record(key).await?;
        let revision = inner.revision + 1;
        let record = StoredRecord {
            value: value.to_vec(),
            create_revision: previous
                .as_ref()
                .map(|p| p.create_revision)
                .unwrap_or(revision),
            mod_revision: revision,
            lease,
        };
        self.backend.put(key, &serde_json::to_vec(&record)?).await?;
        inner.revision = revision;

        if let Some(old) = previous.and_then(|p| p.lease) {
            if Some(old) != lease {
                if let Some(entry) = inner.leases.get_mut(&old) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(entry) = inner.leases.get_mut(&id) {
                entry.keys.insert(key.to_string());
            }
        }

        self.events.emit(StoreEvent {
            revision,
            event_type: EventType::Put,
            kv: to_key_value(key, record),
        });
        Ok(revision)
    }

    async fn delete_locked(&self, inner: &mut Inner, key: &str) -> Result<bool> {
        let Some(previous) = self.read_record(key).await? else {
            return Ok(false);
        };
        self.backend.delete(key).await?;
        inner.revision += 1;
        let revision = inner.revision;

        if let Some(id) = previous.lease {
            if let Some(entry) = inner.leases.get_mut(&id) {
                entry.keys.remove(key);
            }
        }

        self.events.emit(StoreEvent {
            revision,
            event_type: EventType::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: previous.create_revision,
                mod_revision: revision,
                lease: previous.lease,
            },
        });
        Ok(true)
    }
}

fn to_key_value(key: &str, record: StoredRecord) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: record.value,
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        lease: record.lease,
    }
}

fn remaining_secs(deadline: Instant, now: Instant) -> i64 {
    let remaining = deadline.saturating_duration_since(now);
    remaining.as_millis().div_ceil(1000) as i64
}

#[async_trait]
impl CoordStore for EmbeddedStore {
    async fn status(&self, endpoint: &str) -> Result<Revision> {
        self.ensure_available()?;
        let down = self
            .down_endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(endpoint);
        if down {
            return Err(StoreError::Unavailable(format!(
                "endpoint {} is unreachable",
                endpoint
            )));
        }
        Ok(self.inner.lock().await.revision)
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<Revision> {
        let mut inner = self.lock_fresh().await?;
        self.put_locked(&mut inner, key, value, lease).await
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let _inner = self.lock_fresh().await?;
        Ok(self
            .read_record(key)
            .await?
            .map(|record| to_key_value(key, record)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let _inner = self.lock_fresh().await?;
        let mut out = Vec::new();
        for (key, raw) in self.backend.list_prefix(prefix).await? {
            let record: StoredRecord = serde_json::from_slice(&raw)?;
            out.push(to_key_value(&key, record));
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock_fresh().await?;
        self.delete_locked(&mut inner, key).await
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "lease TTL must be positive, got {}",
                ttl_secs
            )));
        }
        let mut inner = self.lock_fresh().await?;
        let deadline = lease_deadline(ttl_secs)?;
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            LeaseEntry {
                granted_ttl: ttl_secs,
                deadline,
                keys: BTreeSet::new(),
            },
        );
        debug!(lease = %lease_hex(id), ttl_secs, "Lease granted");
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<i64> {
        let mut inner = self.lock_fresh().await?;
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = lease_deadline(entry.granted_ttl)?;
        Ok(entry.granted_ttl)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock_fresh().await?;
        let entry = inner
            .leases
            .remove(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        for key in entry.keys {
            self.delete_locked(&mut inner, &key).await?;
        }
        debug!(lease = %lease_hex(lease), "Lease revoked");
        Ok(())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<LeaseTimeToLive>> {
        let inner = self.lock_fresh().await?;
        let now = Instant::now();
        Ok(inner.leases.get(&lease).map(|entry| LeaseTimeToLive {
            id: lease,
            granted_ttl: entry.granted_ttl,
            ttl: remaining_secs(entry.deadline, now),
            keys: entry.keys.iter().cloned().collect(),
        }))
    }

    async fn leases(&self) -> Result<Vec<LeaseId>> {
        let inner = self.lock_fresh().await?;
        let mut ids: Vec<LeaseId> = inner.leases.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.ensure_available()?;
        Ok(self.events.subscribe(prefix))
    }
}

/// Connector that hands out a shared [`EmbeddedStore`].
pub struct EmbeddedConnector {
    store: Arc<EmbeddedStore>,
    dials: AtomicUsize,
}

impl EmbeddedConnector {
    pub fn new(store: Arc<EmbeddedStore>) -> Self {
        Self {
            store,
            dials: AtomicUsize::new(0),
        }
    }

    /// Number of successful dials so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for EmbeddedConnector {
    async fn connect(&self, config: &DialConfig) -> Result<Arc<dyn CoordStore>> {
        if config.endpoints.is_empty() {
            return Err(StoreError::InvalidArgument(
                "at least one endpoint is required".to_string(),
            ));
        }
        self.store.ensure_available()?;
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.clone())
    }
}

fn lease_deadline(ttl_secs: i64) -> Result<Instant> {
    Instant::now()
        .checked_add(Duration::from_secs(ttl_secs as u64))
        .ok_or_else(|| StoreError::InvalidArgument(format!("lease TTL {} is too large", ttl_secs)))
}
