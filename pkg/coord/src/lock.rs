use chrono::{DateTime, Utc};
use pkg_types::lease::{LeaseId, lease_hex};
use pkg_types::lock::LockInfo;
use pkg_types::validate::validate_segment;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::lock_key_prefix;
use crate::connection::ConnectionManager;
use crate::context::cancellable;
use crate::error::{CoordError, Result, codes, store_err};
use crate::lease::LeaseManager;
use crate::mutex::{SequencedMutex, Session};

/// What this process believes it holds.
struct LockEntry {
    session: Arc<Session>,
    mutex: Arc<SequencedMutex>,
    lease_id: LeaseId,
    acquired_at: DateTime<Utc>,
    ttl_seconds: i64,
}

enum LockSlot {
    Acquiring,
    Held(LockEntry),
}

type LockTable = RwLock<HashMap<String, LockSlot>>;

/// Lease-bound mutual exclusion keyed by name.
///
/// The local table only short-circuits double acquisition within this
/// process; the sequenced mutex in the store decides ownership. Loss of a
/// lock through lease expiry is noticed on the next operation touching it.
pub struct DistributedLock {
    conn: Arc<ConnectionManager>,
    leases: Arc<LeaseManager>,
    lock_prefix: String,
    default_ttl: i64,
    try_lock_timeout: Duration,
    owner_id: String,
    locks: LockTable,
}

impl DistributedLock {
    pub fn new(
        conn: Arc<ConnectionManager>,
        leases: Arc<LeaseManager>,
        lock_prefix: impl Into<String>,
        default_ttl: i64,
        try_lock_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            leases,
            lock_prefix: lock_prefix.into(),
            default_ttl,
            try_lock_timeout,
            owner_id: Uuid::new_v4().to_string(),
            locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Block until `key` is acquired or `cancel` fires. A non-positive `ttl`
    /// uses the default.
    pub async fn lock(&self, cancel: &CancellationToken, key: &str, ttl: i64) -> Result<()> {
        let mut reservation = self.reserve(key)?;
        let entry = self.acquire(cancel, key, ttl, None, &mut reservation).await?;
        reservation.commit(entry);
        info!(key, owner = %self.owner_id, "Lock acquired");
        Ok(())
    }

    /// Like [`lock`](Self::lock), but gives up after a short wait. Contention
    /// is `Ok(false)`, not an error.
    pub async fn try_lock(&self, cancel: &CancellationToken, key: &str, ttl: i64) -> Result<bool> {
        let mut reservation = self.reserve(key)?;
        match self
            .acquire(cancel, key, ttl, Some(self.try_lock_timeout), &mut reservation)
            .await
        {
            Ok(entry) => {
                reservation.commit(entry);
                info!(key, owner = %self.owner_id, "Lock acquired");
                Ok(true)
            }
            Err(e) if e.code == codes::LOCK_ACQUISITION_TIMEOUT => {
                debug!(key, "Lock is held elsewhere");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn reserve(&self, key: &str) -> Result<Reservation<'_>> {
        validate_segment("lock key", key)
            .map_err(|e| CoordError::new(codes::INVALID_CONFIGURATION, e.to_string()))?;
        let mut locks = write(&self.locks);
        if locks.contains_key(key) {
            return Err(CoordError::new(
                codes::LOCK_ALREADY_HELD,
                format!("lock {} is already held by this process", key),
            ));
        }
        locks.insert(key.to_string(), LockSlot::Acquiring);
        Ok(Reservation {
            lock: self,
            key: key.to_string(),
            lease: None,
            armed: true,
        })
    }

    async fn acquire(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: i64,
        limit: Option<Duration>,
        reservation: &mut Reservation<'_>,
    ) -> Result<LockEntry> {
        let ttl = if ttl > 0 { ttl } else { self.default_ttl };
        let client = self.conn.client()?;

        let lease = self.leases.create_lease(cancel, ttl).await.map_err(|e| {
            if e.is_canceled() {
                e
            } else {
                CoordError::wrap(codes::LOCK_ACQUISITION_FAILED, "failed to create lock lease", e)
            }
        })?;
        reservation.lease = Some(lease);

        if let Err(e) = self.leases.keep_alive(cancel, lease).await {
            self.revoke_quietly(lease).await;
            reservation.lease = None;
            if e.is_canceled() {
                return Err(e);
            }
            return Err(CoordError::wrap(
                codes::LOCK_ACQUISITION_FAILED,
                "failed to start lock keepalive",
                e,
            ));
        }

        let session = Arc::new(Session::new(client, lease));
        let mutex = Arc::new(SequencedMutex::new(
            session.clone(),
            lock_key_prefix(&self.lock_prefix, key),
        ));

        let outcome = match limit {
            None => mutex.lock(cancel).await,
            Some(limit) => {
                let attempt = cancel.child_token();
                let timer = {
                    let attempt = attempt.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(limit).await;
                        attempt.cancel();
                    })
                };
                let result = mutex.lock(&attempt).await;
                timer.abort();
                match result {
                    Err(e) if e.is_canceled() && !cancel.is_cancelled() => Err(CoordError::new(
                        codes::LOCK_ACQUISITION_TIMEOUT,
                        format!("lock {} not acquired within {}ms", key, limit.as_millis()),
                    )),
                    other => other,
                }
            }
        };

        if let Err(e) = outcome {
            session.close();
            self.revoke_quietly(lease).await;
            reservation.lease = None;
            return Err(e);
        }

        Ok(LockEntry {
            session,
            mutex,
            lease_id: lease,
            acquired_at: Utc::now(),
            ttl_seconds: ttl,
        })
    }

    /// Release `key`. Releasing a lock not held here is a no-op.
    pub async fn unlock(&self, _cancel: &CancellationToken, key: &str) -> Result<()> {
        let entry = {
            let mut locks = write(&self.locks);
            match locks.get(key) {
                Some(LockSlot::Held(_)) => match locks.remove(key) {
                    Some(LockSlot::Held(entry)) => entry,
                    _ => return Ok(()),
                },
                _ => return Ok(()),
            }
        };
        self.release(key, entry).await;
        info!(key, "Lock released");
        Ok(())
    }

    /// Extend the lease bound to `key`.
    pub async fn refresh(&self, cancel: &CancellationToken, key: &str, ttl: i64) -> Result<()> {
        let lease = self.held_lease(key)?;
        let ttl = if ttl > 0 { ttl } else { self.default_ttl };
        match self.leases.refresh_lease(cancel, lease, ttl).await {
            Ok(()) => {
                if let Some(LockSlot::Held(entry)) = write(&self.locks).get_mut(key) {
                    entry.ttl_seconds = ttl;
                }
                Ok(())
            }
            Err(e) if lease_gone(&e) => {
                self.mark_lost(key, lease);
                Err(CoordError::wrap(
                    codes::LOCK_NOT_HELD,
                    format!("lock {} was lost", key),
                    e,
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether anyone holds `key`. Checks the local table first, then the
    /// store, since another process may hold it.
    pub async fn is_locked(&self, cancel: &CancellationToken, key: &str) -> Result<bool> {
        if let Ok(lease) = self.held_lease(key) {
            match self.leases.get_lease_info(cancel, lease).await {
                Ok(_) => return Ok(true),
                Err(e) if lease_gone(&e) => self.mark_lost(key, lease),
                Err(e) => return Err(e),
            }
        }
        let client = self.conn.client()?;
        let prefix = lock_key_prefix(&self.lock_prefix, key);
        let contenders = cancellable(cancel, async {
            client
                .get_prefix(&prefix)
                .await
                .map_err(store_err(codes::LOCK_ACQUISITION_FAILED, "failed to read lock queue"))
        })
        .await?;
        Ok(!contenders.is_empty())
    }

    /// Details of a lock held here, with the TTL left on its lease.
    pub async fn get_lock_info(&self, cancel: &CancellationToken, key: &str) -> Result<LockInfo> {
        let (lease, acquired_at) = {
            let locks = read(&self.locks);
            match locks.get(key) {
                Some(LockSlot::Held(entry)) => (entry.lease_id, entry.acquired_at),
                _ => return Err(not_held(key)),
            }
        };
        match self.leases.get_lease_info(cancel, lease).await {
            Ok(ttl) => Ok(LockInfo {
                key: key.to_string(),
                owner: self.owner_id.clone(),
                lease_id: lease,
                ttl_seconds: ttl.ttl,
                acquired_at,
            }),
            Err(e) if lease_gone(&e) => {
                self.mark_lost(key, lease);
                Err(CoordError::wrap(
                    codes::LOCK_NOT_HELD,
                    format!("lock {} was lost", key),
                    e,
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Keys this process believes it holds.
    pub fn held_locks(&self) -> Vec<String> {
        let mut keys: Vec<String> = read(&self.locks)
            .iter()
            .filter(|(_, slot)| matches!(slot, LockSlot::Held(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop held entries whose lease the store no longer has.
    pub async fn cleanup_expired_locks(&self, cancel: &CancellationToken) -> Result<usize> {
        let held: Vec<(String, LeaseId)> = read(&self.locks)
            .iter()
            .filter_map(|(key, slot)| match slot {
                LockSlot::Held(entry) => Some((key.clone(), entry.lease_id)),
                LockSlot::Acquiring => None,
            })
            .collect();

        let mut removed = 0;
        for (key, lease) in held {
            match self.leases.get_lease_info(cancel, lease).await {
                Ok(_) => {}
                Err(e) if lease_gone(&e) => {
                    self.mark_lost(&key, lease);
                    removed += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not probe lock lease");
                }
            }
        }
        if removed > 0 {
            info!(removed, "Cleaned up expired locks");
        }
        Ok(removed)
    }

    /// Release every held lock, best-effort.
    pub async fn close(&self) -> Result<()> {
        let held: Vec<(String, LockEntry)> = {
            let mut locks = write(&self.locks);
            let keys: Vec<String> = locks
                .iter()
                .filter(|(_, slot)| matches!(slot, LockSlot::Held(_)))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| match locks.remove(&key) {
                    Some(LockSlot::Held(entry)) => Some((key, entry)),
                    _ => None,
                })
                .collect()
        };
        let count = held.len();
        for (key, entry) in held {
            self.release(&key, entry).await;
        }
        if count > 0 {
            info!(released = count, "Distributed lock closed");
        }
        Ok(())
    }

    async fn release(&self, key: &str, entry: LockEntry) {
        if let Err(e) = entry.mutex.unlock().await {
            warn!(key, error = %e, "Failed to release mutex");
        }
        entry.session.close();
        self.revoke_quietly(entry.lease_id).await;
    }

    fn held_lease(&self, key: &str) -> Result<LeaseId> {
        match read(&self.locks).get(key) {
            Some(LockSlot::Held(entry)) => Ok(entry.lease_id),
            _ => Err(not_held(key)),
        }
    }

    /// Held -> Lost: drop the entry if it still refers to `lease`.
    fn mark_lost(&self, key: &str, lease: LeaseId) {
        let entry = {
            let mut locks = write(&self.locks);
            match locks.get(key) {
                Some(LockSlot::Held(entry)) if entry.lease_id == lease => locks.remove(key),
                _ => None,
            }
        };
        if let Some(LockSlot::Held(entry)) = entry {
            entry.session.close();
            self.leases.stop_keep_alive(lease);
            warn!(key, lease = %lease_hex(lease), "Lock lost, its lease expired");
        }
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        if let Err(e) = self.leases.revoke_lease(&CancellationToken::new(), lease).await {
            warn!(lease = %lease_hex(lease), error = %e, "Failed to revoke lock lease");
        }
    }
}

/// Local claim on a key while it is being acquired. Dropped without
/// [`commit`](Reservation::commit), it frees the key and revokes any lease
/// already created, which also removes its queue entry from the store.
struct Reservation<'a> {
    lock: &'a DistributedLock,
    key: String,
    lease: Option<LeaseId>,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, entry: LockEntry) {
        write(&self.lock.locks).insert(self.key.clone(), LockSlot::Held(entry));
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut locks = write(&self.lock.locks);
        if matches!(locks.get(&self.key), Some(LockSlot::Acquiring)) {
            locks.remove(&self.key);
        }
        drop(locks);
        if let Some(lease) = self.lease {
            self.lock.leases.revoke_detached(lease);
        }
    }
}

fn lease_gone(e: &CoordError) -> bool {
    matches!(e.code, codes::LEASE_EXPIRED | codes::LEASE_NOT_FOUND)
}

fn not_held(key: &str) -> CoordError {
    CoordError::new(
        codes::LOCK_NOT_HELD,
        format!("lock {} is not held by this process", key),
    )
}

fn read(table: &LockTable) -> std::sync::RwLockReadGuard<'_, HashMap<String, LockSlot>> {
    table.read().unwrap_or_else(|e| e.into_inner())
}

fn write(table: &LockTable) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LockSlot>> {
    table.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::{CoordStore, DialConfig, EmbeddedConnector, EmbeddedStore};

    async fn locker(store: &Arc<EmbeddedStore>) -> (Arc<LeaseManager>, DistributedLock) {
        let connector = Arc::new(EmbeddedConnector::new(store.clone()));
        let conn = Arc::new(ConnectionManager::new(
            connector,
            DialConfig {
                endpoints: vec!["local:2379".into()],
                dial_timeout: Duration::from_secs(1),
                username: None,
                password: None,
            },
            Duration::from_secs(1),
        ));
        conn.connect(&CancellationToken::new()).await.unwrap();
        let leases = Arc::new(LeaseManager::new(conn.clone()));
        let lock = DistributedLock::new(
            conn,
            leases.clone(),
            "/locks",
            10,
            Duration::from_millis(100),
        );
        (leases, lock)
    }

    #[tokio::test]
    async fn test_lock_unlock_cycle() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (leases, lock) = locker(&store).await;
        let cancel = CancellationToken::new();

        lock.lock(&cancel, "orders", 5).await.unwrap();
        assert_eq!(lock.held_locks(), vec!["orders".to_string()]);
        assert!(lock.is_locked(&cancel, "orders").await.unwrap());
        let info = lock.get_lock_info(&cancel, "orders").await.unwrap();
        assert_eq!(info.owner, lock.owner_id());
        assert!(info.ttl_seconds > 0 && info.ttl_seconds <= 5);

        lock.unlock(&cancel, "orders").await.unwrap();
        lock.unlock(&cancel, "orders").await.unwrap();
        assert!(lock.held_locks().is_empty());
        assert!(!lock.is_locked(&cancel, "orders").await.unwrap());
        assert!(leases.managed_leases().is_empty());
        assert!(store.leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_double_lock_is_rejected() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (_leases, lock) = locker(&store).await;
        let cancel = CancellationToken::new();
        lock.lock(&cancel, "orders", 5).await.unwrap();

        let err = lock.lock(&cancel, "orders", 5).await.unwrap_err();
        assert_eq!(err.code, codes::LOCK_ALREADY_HELD);
        let err = lock.try_lock(&cancel, "orders", 5).await.unwrap_err();
        assert_eq!(err.code, codes::LOCK_ALREADY_HELD);
    }

    #[tokio::test]
    async fn test_oversized_ttl_fails_cleanly() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (leases, lock) = locker(&store).await;
        let cancel = CancellationToken::new();

        let err = lock.lock(&cancel, "orders", i64::MAX).await.unwrap_err();
        assert_eq!(err.code, codes::LOCK_ACQUISITION_FAILED);
        assert!(lock.held_locks().is_empty());
        assert!(leases.managed_leases().is_empty());

        // The key was released locally.
        lock.lock(&cancel, "orders", 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_acquisition_revokes_its_lease() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (_holder_leases, holder) = locker(&store).await;
        let (quitter_leases, quitter) = locker(&store).await;
        let cancel = CancellationToken::new();
        holder.lock(&cancel, "orders", 30).await.unwrap();

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            quitter.lock(&cancel, "orders", 30),
        )
        .await;
        assert!(attempt.is_err());
        assert!(quitter_leases.managed_leases().is_empty());
        assert!(quitter.held_locks().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get_prefix("/locks/orders/").await.unwrap().len(), 1);
        assert_eq!(store.leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_try_lock_reports_contention() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (_a_leases, a) = locker(&store).await;
        let (b_leases, b) = locker(&store).await;
        let cancel = CancellationToken::new();

        assert!(a.try_lock(&cancel, "orders", 5).await.unwrap());
        assert!(!b.try_lock(&cancel, "orders", 5).await.unwrap());
        assert!(b.held_locks().is_empty());
        assert!(b_leases.managed_leases().is_empty());
        assert!(b.is_locked(&cancel, "orders").await.unwrap());

        a.unlock(&cancel, "orders").await.unwrap();
        assert!(b.try_lock(&cancel, "orders", 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_and_not_held() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (_leases, lock) = locker(&store).await;
        let cancel = CancellationToken::new();

        let err = lock.refresh(&cancel, "orders", 5).await.unwrap_err();
        assert_eq!(err.code, codes::LOCK_NOT_HELD);

        lock.lock(&cancel, "orders", 5).await.unwrap();
        lock.refresh(&cancel, "orders", 3).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lock_is_detected_lazily() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (leases, lock) = locker(&store).await;
        let cancel = CancellationToken::new();
        lock.lock(&cancel, "orders", 2).await.unwrap();

        let lease = lock.get_lock_info(&cancel, "orders").await.unwrap().lease_id;
        leases.stop_keep_alive(lease);
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Still believed held until something looks.
        assert_eq!(lock.held_locks(), vec!["orders".to_string()]);
        let err = lock.get_lock_info(&cancel, "orders").await.unwrap_err();
        assert_eq!(err.code, codes::LOCK_NOT_HELD);
        assert!(lock.held_locks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_locks() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (leases, lock) = locker(&store).await;
        let cancel = CancellationToken::new();
        lock.lock(&cancel, "a", 2).await.unwrap();
        lock.lock(&cancel, "b", 30).await.unwrap();

        let lease = lock.get_lock_info(&cancel, "a").await.unwrap().lease_id;
        leases.stop_keep_alive(lease);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(lock.cleanup_expired_locks(&cancel).await.unwrap(), 1);
        assert_eq!(lock.held_locks(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let store = EmbeddedStore::in_memory().await.unwrap();
        let (_leases, lock) = locker(&store).await;
        let cancel = CancellationToken::new();
        lock.lock(&cancel, "a", 5).await.unwrap();
        lock.lock(&cancel, "b", 5).await.unwrap();

        lock.close().await.unwrap();
        lock.close().await.unwrap();
        assert!(lock.held_locks().is_empty());
        assert!(store.get_prefix("/locks/").await.unwrap().is_empty());
    }
}
