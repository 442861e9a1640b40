//! Fair distributed mutex built from ordered keys, a lease and a watch.
//!
//! Each contender writes `<prefix><lease hex>` bound to its session lease.
//! The key with the lowest create revision holds the mutex; everyone else
//! waits for the delete of the key just ahead of theirs, which yields FIFO
//! hand-off in enqueue order.

use pkg_state::{CoordStore, EventType, StoreError};
use pkg_types::lease::{LeaseId, lease_hex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::cancellable;
use crate::error::{CoordError, ErrorKind, Result, codes};

/// A lease-bound client handle scoping one or more mutexes.
///
/// Closing a session never revokes its lease; the lease belongs to whoever
/// granted it.
pub struct Session {
    store: Arc<dyn CoordStore>,
    lease: LeaseId,
    closed: AtomicBool,
}

impl Session {
    pub fn new(store: Arc<dyn CoordStore>, lease: LeaseId) -> Self {
        Self {
            store,
            lease,
            closed: AtomicBool::new(false),
        }
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn store(&self) -> &Arc<dyn CoordStore> {
        &self.store
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct SequencedMutex {
    session: Arc<Session>,
    /// Queue prefix, ending in `/`.
    prefix: String,
    /// This session's queue entry.
    key: String,
}

impl SequencedMutex {
    pub fn new(session: Arc<Session>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let key = format!("{}{}", prefix, lease_hex(session.lease()));
        Self {
            session,
            prefix,
            key,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until this session owns the mutex or `cancel` fires. On any
    /// failure the queue entry is removed before returning.
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<()> {
        if self.session.is_closed() {
            return Err(CoordError::new(codes::INVALID_STATE, "session is closed"));
        }
        let result = cancellable(cancel, self.acquire()).await;
        if let Err(e) = &result {
            debug!(key = %self.key, error = %e, "Mutex acquisition aborted, leaving queue");
            if let Err(cleanup) = self.session.store().delete(&self.key).await {
                warn!(key = %self.key, error = %cleanup, "Failed to remove mutex queue entry");
            }
        }
        result
    }

    async fn acquire(&self) -> Result<()> {
        let store = self.session.store();
        let existing = store.get(&self.key).await.map_err(lock_err)?;
        if existing.is_none() {
            store
                .put(&self.key, b"", Some(self.session.lease()))
                .await
                .map_err(|e| match e {
                    StoreError::LeaseNotFound(_) => {
                        CoordError::wrap(codes::LEASE_EXPIRED, "session lease expired", e)
                    }
                    other => lock_err(other),
                })?;
        }

        loop {
            // Subscribe before reading so no delete slips between the two.
            let mut watch = store.watch(&self.prefix).await.map_err(lock_err)?;
            let contenders = store.get_prefix(&self.prefix).await.map_err(lock_err)?;

            let Some(mine) = contenders.iter().find(|kv| kv.key == self.key) else {
                return Err(CoordError::new(
                    codes::LOCK_ACQUISITION_FAILED,
                    "mutex queue entry vanished, session lease expired",
                ));
            };
            let predecessor = contenders
                .iter()
                .filter(|kv| kv.create_revision < mine.create_revision)
                .max_by_key(|kv| kv.create_revision);
            let Some(predecessor) = predecessor else {
                debug!(key = %self.key, "Mutex acquired");
                return Ok(());
            };

            let waiting_on = predecessor.key.clone();
            debug!(key = %self.key, waiting_on = %waiting_on, "Waiting for mutex");
            loop {
                let Some(event) = watch.next().await else {
                    return Err(CoordError::new(
                        codes::CONNECTION_LOST,
                        "watch on mutex queue ended",
                    ));
                };
                if event.event_type == EventType::Delete
                    && (event.kv.key == waiting_on || event.kv.key == self.key)
                {
                    break;
                }
            }
        }
    }

    /// Leave the queue, releasing the mutex if held.
    pub async fn unlock(&self) -> Result<()> {
        self.session
            .store()
            .delete(&self.key)
            .await
            .map(|_| ())
            .map_err(|e| CoordError::wrap_kind(ErrorKind::Lock, "failed to release mutex", e))
    }

    /// Whether this session's entry currently heads the queue.
    pub async fn is_owner(&self) -> Result<bool> {
        let contenders = self
            .session
            .store()
            .get_prefix(&self.prefix)
            .await
            .map_err(lock_err)?;
        Ok(contenders
            .iter()
            .min_by_key(|kv| kv.create_revision)
            .is_some_and(|head| head.key == self.key))
    }
}

fn lock_err(e: StoreError) -> CoordError {
    CoordError::wrap(codes::LOCK_ACQUISITION_FAILED, "mutex store operation failed", e)
}
