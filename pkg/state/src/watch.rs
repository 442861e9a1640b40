use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{StoreEvent, WatchStream};

/// Fan-out of store mutations to prefix watchers.
///
/// Events are emitted while the store's write lock is held, so every
/// subscriber observes them in apply order. A subscriber that falls more than
/// the channel capacity behind has its stream ended instead of skipping events.
pub struct EventLog {
    sender: broadcast::Sender<StoreEvent>,
    /// Cancelled (and replaced) to end every open stream at once.
    shutdown: Mutex<CancellationToken>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Publish an event to every subscriber (ignored if there are none).
    pub fn emit(&self, event: StoreEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Subscribe to events whose key starts with `prefix`.
    pub fn subscribe(&self, prefix: &str) -> WatchStream {
        let rx = self.sender.subscribe();
        let shutdown = self.current_shutdown();
        let prefix = prefix.to_string();

        let stream = futures_util::stream::unfold(
            (rx, shutdown, prefix),
            |(mut rx, shutdown, prefix)| async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => None,
                        received = rx.recv() => Some(received),
                    };
                    match received {
                        None => return None,
                        Some(Ok(event)) if event.kv.key.starts_with(&prefix) => {
                            return Some((event, (rx, shutdown, prefix)));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(broadcast::error::RecvError::Lagged(missed))) => {
                            debug!(prefix = %prefix, missed, "Watcher lagged, cancelling its stream");
                            return None;
                        }
                        Some(Err(broadcast::error::RecvError::Closed)) => return None,
                    }
                }
            },
        );
        Box::pin(stream)
    }

    /// End every stream opened so far. Later subscriptions are unaffected.
    pub fn close_all(&self) {
        let mut guard = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        guard.cancel();
        *guard = CancellationToken::new();
    }

    fn current_shutdown(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventType, KeyValue};
    use tokio_stream::StreamExt;

    fn put_event(revision: i64, key: &str) -> StoreEvent {
        StoreEvent {
            revision,
            event_type: EventType::Put,
            kv: KeyValue {
                key: key.to_string(),
                value: b"v".to_vec(),
                create_revision: revision,
                mod_revision: revision,
                lease: None,
            },
        }
    }

    #[tokio::test]
    async fn test_prefix_filter_and_order() {
        let log = EventLog::new(16);
        let mut stream = log.subscribe("/services/api/");

        log.emit(put_event(1, "/services/api/a"));
        log.emit(put_event(2, "/services/web/a"));
        log.emit(put_event(3, "/services/api/b"));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 3);
    }

    #[tokio::test]
    async fn test_close_all_ends_open_streams_only() {
        let log = EventLog::new(16);
        let mut old = log.subscribe("/");
        log.close_all();
        let mut fresh = log.subscribe("/");

        assert!(old.next().await.is_none());
        log.emit(put_event(7, "/x"));
        assert_eq!(fresh.next().await.unwrap().revision, 7);
    }

    #[tokio::test]
    async fn test_lagging_watcher_is_cancelled() {
        let log = EventLog::new(2);
        let mut stream = log.subscribe("/");
        for rev in 1..=5 {
            log.emit(put_event(rev, "/k"));
        }
        assert!(stream.next().await.is_none());
    }
}
