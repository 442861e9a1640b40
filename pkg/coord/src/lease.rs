use chrono::{DateTime, Utc};
use pkg_constants::coord::{
    KEEPALIVE_CHANNEL_CAPACITY, KEEPALIVE_INTERVAL_DIVISOR, MAX_LEASE_TTL_SECS,
    MIN_KEEPALIVE_INTERVAL_MS,
};
use pkg_state::StoreError;
use pkg_types::lease::{LeaseId, LeaseInfo, LeaseTimeToLive, lease_hex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::context::cancellable;
use crate::error::{CoordError, ErrorKind, Result, codes, retry_delay, store_err};

/// One successful renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease_id: LeaseId,
    /// TTL the store reset the lease to, in seconds.
    pub ttl: i64,
}

struct ManagedLease {
    /// TTL requested by the owner, in seconds.
    ttl_seconds: i64,
    /// TTL the store renews the lease to, in seconds.
    granted_ttl: i64,
    granted_at: DateTime<Utc>,
    keepalive: Option<CancellationToken>,
}

impl ManagedLease {
    fn heartbeat_interval(&self) -> Duration {
        let ttl = self.ttl_seconds.min(self.granted_ttl).max(1) as u64;
        let interval = Duration::from_secs(ttl) / KEEPALIVE_INTERVAL_DIVISOR;
        interval.max(Duration::from_millis(MIN_KEEPALIVE_INTERVAL_MS))
    }
}

type LeaseTable = Arc<RwLock<HashMap<LeaseId, ManagedLease>>>;

/// Creates leases and keeps them alive.
///
/// A failed renewal is retried with backoff for as long as the lease can
/// still be alive. Once the store no longer knows the lease, or its TTL has
/// run out since the last renewal, the record is dropped and the ack channel
/// closes. Recreating the lease is left to the owner.
pub struct LeaseManager {
    conn: Arc<ConnectionManager>,
    leases: LeaseTable,
    /// Parent of every keepalive loop.
    root: CancellationToken,
    closed: AtomicBool,
}

impl LeaseManager {
    pub fn new(conn: Arc<ConnectionManager>) -> Self {
        Self {
            conn,
            leases: Arc::new(RwLock::new(HashMap::new())),
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn create_lease(&self, cancel: &CancellationToken, ttl_seconds: i64) -> Result<LeaseId> {
        self.ensure_open()?;
        if ttl_seconds <= 0 || ttl_seconds > MAX_LEASE_TTL_SECS {
            return Err(CoordError::new(
                codes::LEASE_CREATION_FAILED,
                format!(
                    "lease TTL must be between 1 and {}, got {}",
                    MAX_LEASE_TTL_SECS, ttl_seconds
                ),
            ));
        }
        let client = self.conn.client()?;
        let id = cancellable(cancel, async {
            client
                .grant(ttl_seconds)
                .await
                .map_err(store_err(codes::LEASE_CREATION_FAILED, "failed to grant lease"))
        })
        .await?;

        write(&self.leases).insert(
            id,
            ManagedLease {
                ttl_seconds,
                granted_ttl: ttl_seconds,
                granted_at: Utc::now(),
                keepalive: None,
            },
        );
        info!(lease = %lease_hex(id), ttl_seconds, "Lease created");
        Ok(id)
    }

    /// Start renewing `lease` in the background.
    ///
    /// The loop outlives `cancel` (which only bounds the setup) and runs until
    /// [`stop_keep_alive`](Self::stop_keep_alive), revoke, close, or loss of
    /// the lease. The returned channel closes when the loop ends. Acks are
    /// dropped while it is full, and renewals go on after the receiver is
    /// dropped.
    pub async fn keep_alive(
        &self,
        cancel: &CancellationToken,
        lease: LeaseId,
    ) -> Result<mpsc::Receiver<KeepAliveAck>> {
        self.ensure_open()?;
        let tracked = read(&self.leases).get(&lease).map(|l| l.keepalive.is_some());
        match tracked {
            Some(true) => {
                return Err(CoordError::new(
                    codes::INVALID_STATE,
                    format!("lease {} already has a keepalive", lease_hex(lease)),
                ));
            }
            Some(false) => {}
            None => {
                // Adopt a lease granted elsewhere.
                let ttl = self.get_lease_info(cancel, lease).await?;
                write(&self.leases).entry(lease).or_insert(ManagedLease {
                    ttl_seconds: ttl.granted_ttl,
                    granted_ttl: ttl.granted_ttl,
                    granted_at: Utc::now(),
                    keepalive: None,
                });
            }
        }

        let token = self.root.child_token();
        {
            let mut leases = write(&self.leases);
            let Some(entry) = leases.get_mut(&lease) else {
                return Err(lease_not_found(lease));
            };
            entry.keepalive = Some(token.clone());
        }

        let (tx, rx) = mpsc::channel(KEEPALIVE_CHANNEL_CAPACITY);
        tokio::spawn(run_keepalive(
            self.conn.clone(),
            self.leases.clone(),
            lease,
            token,
            tx,
        ));
        debug!(lease = %lease_hex(lease), "Keepalive started");
        Ok(rx)
    }

    /// Stop renewing `lease` without revoking it; it expires after its TTL.
    pub fn stop_keep_alive(&self, lease: LeaseId) -> bool {
        let token = write(&self.leases)
            .get_mut(&lease)
            .and_then(|entry| entry.keepalive.take());
        match token {
            Some(token) => {
                token.cancel();
                debug!(lease = %lease_hex(lease), "Keepalive stopped");
                true
            }
            None => false,
        }
    }

    pub fn has_keep_alive(&self, lease: LeaseId) -> bool {
        read(&self.leases)
            .get(&lease)
            .is_some_and(|entry| entry.keepalive.is_some())
    }

    /// Revoke a lease, deleting every key bound to it.
    pub async fn revoke_lease(&self, cancel: &CancellationToken, lease: LeaseId) -> Result<()> {
        self.stop_keep_alive(lease);
        write(&self.leases).remove(&lease);
        let client = self.conn.client()?;
        cancellable(cancel, async {
            client.revoke(lease).await.map_err(|e| match e {
                StoreError::LeaseNotFound(_) => CoordError::wrap(
                    codes::LEASE_NOT_FOUND,
                    format!("lease {} not found", lease_hex(lease)),
                    e,
                ),
                other => CoordError::wrap(codes::LEASE_REVOKE_FAILED, "failed to revoke lease", other),
            })
        })
        .await?;
        info!(lease = %lease_hex(lease), "Lease revoked");
        Ok(())
    }

    /// Forget `lease` now and revoke it in the background, for cleanup paths
    /// that cannot await. Failures are logged.
    pub fn revoke_detached(&self, lease: LeaseId) {
        self.forget(lease);
        let client = match self.conn.client() {
            Ok(client) => client,
            Err(e) => {
                warn!(lease = %lease_hex(lease), error = %e, "Lease left to expire, no store connection");
                return;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lease = %lease_hex(lease), "Lease left to expire, no runtime to revoke it on");
            return;
        };
        runtime.spawn(async move {
            match client.revoke(lease).await {
                Ok(()) => debug!(lease = %lease_hex(lease), "Lease revoked in background"),
                Err(StoreError::LeaseNotFound(_)) => {}
                Err(e) => warn!(lease = %lease_hex(lease), error = %e, "Background lease revoke failed"),
            }
        });
    }

    /// Renew `lease` now and record `ttl_seconds` as its TTL.
    ///
    /// The store cannot change a granted TTL in place, so the renewal resets
    /// the lease to its granted TTL; the recorded TTL drives the heartbeat
    /// interval, which never exceeds a third of the granted TTL.
    pub async fn refresh_lease(
        &self,
        cancel: &CancellationToken,
        lease: LeaseId,
        ttl_seconds: i64,
    ) -> Result<()> {
        if ttl_seconds <= 0 {
            return Err(CoordError::new(
                codes::INVALID_CONFIGURATION,
                format!("lease TTL must be positive, got {}", ttl_seconds),
            ));
        }
        if !read(&self.leases).contains_key(&lease) {
            return Err(lease_not_found(lease));
        }
        let client = self.conn.client()?;
        let renewed = cancellable(cancel, async {
            client.keep_alive_once(lease).await.map_err(|e| match e {
                StoreError::LeaseNotFound(_) => CoordError::wrap(
                    codes::LEASE_EXPIRED,
                    format!("lease {} expired", lease_hex(lease)),
                    e,
                ),
                other => CoordError::wrap_kind(ErrorKind::Lease, "failed to refresh lease", other),
            })
        })
        .await;

        match renewed {
            Ok(granted) => {
                if let Some(entry) = write(&self.leases).get_mut(&lease) {
                    entry.ttl_seconds = ttl_seconds;
                    entry.granted_ttl = granted;
                }
                debug!(lease = %lease_hex(lease), ttl_seconds, "Lease refreshed");
                Ok(())
            }
            Err(e) => {
                if e.code == codes::LEASE_EXPIRED {
                    self.forget(lease);
                }
                Err(e)
            }
        }
    }

    /// Store-side view of a lease. A lease that no longer exists is
    /// `LeaseExpired` when tracked here, `LeaseNotFound` otherwise.
    pub async fn get_lease_info(
        &self,
        cancel: &CancellationToken,
        lease: LeaseId,
    ) -> Result<LeaseTimeToLive> {
        let client = self.conn.client()?;
        let ttl = cancellable(cancel, async {
            client
                .time_to_live(lease)
                .await
                .map_err(store_err(codes::LEASE_NOT_FOUND, "failed to query lease"))
        })
        .await?;
        match ttl {
            Some(ttl) => Ok(ttl),
            None if read(&self.leases).contains_key(&lease) => {
                self.forget(lease);
                Err(CoordError::new(
                    codes::LEASE_EXPIRED,
                    format!("lease {} expired", lease_hex(lease)),
                ))
            }
            None => Err(lease_not_found(lease)),
        }
    }

    /// Every lease alive in the store.
    pub async fn list_leases(&self, cancel: &CancellationToken) -> Result<Vec<LeaseId>> {
        let client = self.conn.client()?;
        cancellable(cancel, async {
            client
                .leases()
                .await
                .map_err(store_err(codes::LEASE_NOT_FOUND, "failed to list leases"))
        })
        .await
    }

    /// Snapshot of the leases tracked by this manager.
    pub fn managed_leases(&self) -> Vec<LeaseInfo> {
        let mut out: Vec<LeaseInfo> = read(&self.leases)
            .iter()
            .map(|(id, entry)| LeaseInfo {
                id: *id,
                ttl_seconds: entry.ttl_seconds,
                granted_at: entry.granted_at,
                keepalive: entry.keepalive.is_some(),
            })
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }

    /// Drop local records of leases the store no longer has.
    pub async fn cleanup_expired_leases(&self, cancel: &CancellationToken) -> Result<usize> {
        let client = self.conn.client()?;
        let ids: Vec<LeaseId> = read(&self.leases).keys().copied().collect();
        let mut removed = 0;
        for id in ids {
            let ttl = cancellable(cancel, async {
                client
                    .time_to_live(id)
                    .await
                    .map_err(store_err(codes::LEASE_NOT_FOUND, "failed to query lease"))
            })
            .await?;
            if ttl.is_none() {
                self.forget(id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Cleaned up expired leases");
        }
        Ok(removed)
    }

    /// Stop every keepalive loop. Leases are left to expire.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.root.cancel();
        let count = {
            let mut leases = write(&self.leases);
            let count = leases.len();
            leases.clear();
            count
        };
        info!(leases = count, "Lease manager closed");
    }

    fn forget(&self, lease: LeaseId) {
        if let Some(entry) = write(&self.leases).remove(&lease) {
            if let Some(token) = entry.keepalive {
                token.cancel();
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CoordError::new(codes::INVALID_STATE, "lease manager is closed"))
        } else {
            Ok(())
        }
    }
}

fn lease_not_found(lease: LeaseId) -> CoordError {
    CoordError::new(
        codes::LEASE_NOT_FOUND,
        format!("lease {} not found", lease_hex(lease)),
    )
}

fn read(table: &LeaseTable) -> std::sync::RwLockReadGuard<'_, HashMap<LeaseId, ManagedLease>> {
    table.read().unwrap_or_else(|e| e.into_inner())
}

fn write(table: &LeaseTable) -> std::sync::RwLockWriteGuard<'_, HashMap<LeaseId, ManagedLease>> {
    table.write().unwrap_or_else(|e| e.into_inner())
}

/// Why a renewal did not go through.
enum Renewal {
    /// The store no longer has the lease.
    Gone(StoreError),
    /// The store could not be reached; the lease may still be alive.
    Failed(String),
}

async fn run_keepalive(
    conn: Arc<ConnectionManager>,
    leases: LeaseTable,
    lease: LeaseId,
    token: CancellationToken,
    tx: mpsc::Sender<KeepAliveAck>,
) {
    let mut acks = Some(tx);
    let mut expires_at = match read(&leases).get(&lease) {
        Some(entry) => lease_expiry(entry.granted_ttl),
        None => return,
    };
    let mut failures: u32 = 0;

    loop {
        if token.is_cancelled() {
            return;
        }

        let renewed = match conn.client() {
            Ok(client) => tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = client.keep_alive_once(lease) => result.map_err(|e| match e {
                    StoreError::LeaseNotFound(_) => Renewal::Gone(e),
                    other => Renewal::Failed(other.to_string()),
                }),
            },
            Err(e) => Err(Renewal::Failed(e.to_string())),
        };

        let pause = match renewed {
            Ok(ttl) => {
                failures = 0;
                expires_at = lease_expiry(ttl);
                if let Some(tx) = &acks {
                    match tx.try_send(KeepAliveAck { lease_id: lease, ttl }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!(lease = %lease_hex(lease), "Keepalive ack dropped, channel full");
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!(lease = %lease_hex(lease), "Keepalive receiver gone, acks stopped");
                            acks = None;
                        }
                    }
                }
                match read(&leases).get(&lease) {
                    Some(entry) => entry.heartbeat_interval(),
                    None => return,
                }
            }
            Err(Renewal::Gone(e)) => {
                warn!(lease = %lease_hex(lease), error = %e, "Keepalive failed, lease is lost");
                drop_lost(&leases, lease, &token);
                return;
            }
            Err(Renewal::Failed(error)) => {
                let now = Instant::now();
                if now >= expires_at {
                    warn!(lease = %lease_hex(lease), error = %error, "Keepalive failed past the lease TTL, lease is lost");
                    drop_lost(&leases, lease, &token);
                    return;
                }
                let delay = retry_delay(failures).min(expires_at - now);
                failures = failures.saturating_add(1);
                warn!(
                    lease = %lease_hex(lease),
                    error = %error,
                    attempt = failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Keepalive failed, retrying"
                );
                delay
            }
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Latest instant the store can still hold a lease renewed now to `ttl`.
fn lease_expiry(ttl: i64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(ttl.max(0) as u64))
        .unwrap_or(now)
}

fn drop_lost(leases: &LeaseTable, lease: LeaseId, token: &CancellationToken) {
    let mut table = write(leases);
    // A stopped loop leaves the record to whoever stopped it.
    let active = !token.is_cancelled()
        && table
            .get(&lease)
            .is_some_and(|entry| entry.keepalive.is_some());
    if active {
        table.remove(&lease);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::{CoordStore, DialConfig, EmbeddedConnector, EmbeddedStore};

    async fn setup() -> (Arc<EmbeddedStore>, LeaseManager) {
        let store = EmbeddedStore::in_memory().await.unwrap();
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
        (store, LeaseManager::new(conn))
    }

    #[tokio::test]
    async fn test_create_and_revoke() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 5).await.unwrap();
        assert_eq!(leases.managed_leases().len(), 1);
        assert_eq!(leases.list_leases(&cancel).await.unwrap(), vec![id]);

        leases.revoke_lease(&cancel, id).await.unwrap();
        assert!(leases.managed_leases().is_empty());
        assert!(store.time_to_live(id).await.unwrap().is_none());

        let err = leases.revoke_lease(&cancel, id).await.unwrap_err();
        assert_eq!(err.code, codes::LEASE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_ttl() {
        let (_store, leases) = setup().await;
        let err = leases
            .create_lease(&CancellationToken::new(), 0)
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::LEASE_CREATION_FAILED);
    }

    #[tokio::test]
    async fn test_ttl_above_maximum_is_rejected() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        for ttl in [MAX_LEASE_TTL_SECS + 1, i64::MAX] {
            let err = leases.create_lease(&cancel, ttl).await.unwrap_err();
            assert_eq!(err.code, codes::LEASE_CREATION_FAILED);
        }
        assert!(leases.managed_leases().is_empty());
        assert!(store.leases().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_lease_past_ttl() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 3).await.unwrap();
        store.put("/k", b"v", Some(id)).await.unwrap();
        let mut acks = leases.keep_alive(&cancel, id).await.unwrap();

        let first = acks.recv().await.unwrap();
        assert_eq!(first, KeepAliveAck { lease_id: id, ttl: 3 });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(store.get("/k").await.unwrap().is_some());
        assert!(leases.has_keep_alive(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_keepalive_lets_lease_expire() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 2).await.unwrap();
        store.put("/k", b"v", Some(id)).await.unwrap();
        let mut acks = leases.keep_alive(&cancel, id).await.unwrap();
        acks.recv().await.unwrap();

        assert!(leases.stop_keep_alive(id));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.get("/k").await.unwrap().is_none());

        let err = leases.get_lease_info(&cancel, id).await.unwrap_err();
        assert_eq!(err.code, codes::LEASE_EXPIRED);
        assert!(leases.managed_leases().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_channel_closes_when_lease_is_lost() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 3).await.unwrap();
        let mut acks = leases.keep_alive(&cancel, id).await.unwrap();
        acks.recv().await.unwrap();

        // Revoked behind the manager's back.
        store.revoke(id).await.unwrap();
        while acks.recv().await.is_some() {}
        assert!(leases.managed_leases().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_rides_out_short_outage() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 30).await.unwrap();
        store.put("/k", b"v", Some(id)).await.unwrap();
        let mut acks = leases.keep_alive(&cancel, id).await.unwrap();
        acks.recv().await.unwrap();

        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(leases.has_keep_alive(id));
        assert!(store.time_to_live(id).await.unwrap().is_some());
        assert!(store.get("/k").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_gives_up_once_ttl_has_passed() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 3).await.unwrap();
        let mut acks = leases.keep_alive(&cancel, id).await.unwrap();
        acks.recv().await.unwrap();

        store.set_available(false);
        let started = Instant::now();
        while acks.recv().await.is_some() {}
        assert!(started.elapsed() <= Duration::from_secs(4));
        assert!(leases.managed_leases().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_outlives_dropped_receiver() {
        let (store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 3).await.unwrap();
        store.put("/k", b"v", Some(id)).await.unwrap();
        drop(leases.keep_alive(&cancel, id).await.unwrap());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(leases.has_keep_alive(id));
        assert!(store.get("/k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_records_ttl() {
        let (_store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let id = leases.create_lease(&cancel, 9).await.unwrap();
        leases.refresh_lease(&cancel, id, 6).await.unwrap();
        assert_eq!(leases.managed_leases()[0].ttl_seconds, 6);

        let err = leases.refresh_lease(&cancel, 0xdead, 6).await.unwrap_err();
        assert_eq!(err.code, codes::LEASE_NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_close() {
        let (_store, leases) = setup().await;
        let cancel = CancellationToken::new();
        let short = leases.create_lease(&cancel, 1).await.unwrap();
        let long = leases.create_lease(&cancel, 60).await.unwrap();
        let _acks = leases.keep_alive(&cancel, long).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(leases.cleanup_expired_leases(&cancel).await.unwrap(), 1);
        let remaining: Vec<LeaseId> = leases.managed_leases().iter().map(|l| l.id).collect();
        assert_eq!(remaining, vec![long]);
        assert_ne!(short, long);

        leases.close();
        leases.close();
        assert!(leases.managed_leases().is_empty());
        assert_eq!(
            leases.create_lease(&cancel, 5).await.unwrap_err().code,
            codes::INVALID_STATE
        );
    }
}
