use async_trait::async_trait;
use pkg_constants::coord::WATCH_EVENT_BUFFER;
use pkg_types::service::{ServiceEvent, ServiceEventType, ServiceInstance};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::ServiceDiscovery;
use crate::error::{Result, codes};
use crate::options::RetryConfig;

/// The discovery operations a resubscribing watch needs.
#[async_trait]
pub trait ServiceSource: Send + Sync {
    async fn watch_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<mpsc::Receiver<ServiceEvent>>;

    async fn resolve_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<ServiceInstance>>;
}

#[async_trait]
impl ServiceSource for ServiceDiscovery {
    async fn watch_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<mpsc::Receiver<ServiceEvent>> {
        ServiceDiscovery::watch_service(self, cancel, service).await
    }

    async fn resolve_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<ServiceInstance>> {
        ServiceDiscovery::resolve_service(self, cancel, service).await
    }
}

/// Watch that re-subscribes with backoff whenever the underlying stream ends.
///
/// After each re-subscription the current instances are re-emitted as `Add`
/// events, so a consumer may see an instance added more than once but never
/// misses one that exists.
pub struct ResilientWatch {
    source: Arc<dyn ServiceSource>,
    retry: RetryConfig,
}

impl ResilientWatch {
    pub fn new(source: Arc<dyn ServiceSource>, retry: RetryConfig) -> Self {
        Self { source, retry }
    }

    /// Events for `service` until `cancel` fires or the receiver is dropped.
    pub fn watch(&self, cancel: CancellationToken, service: &str) -> mpsc::Receiver<ServiceEvent> {
        let (tx, rx) = mpsc::channel(WATCH_EVENT_BUFFER);
        let source = self.source.clone();
        let retry = self.retry.clone();
        let service = service.to_string();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            let mut resubscribed = false;
            loop {
                match source.watch_service(&cancel, &service).await {
                    Ok(mut events) => {
                        if resubscribed {
                            info!(service = %service, "Watch re-established");
                            if !resync(&*source, &cancel, &service, &tx).await {
                                return;
                            }
                        }
                        attempt = 0;
                        loop {
                            let next = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return,
                                next = events.recv() => next,
                            };
                            let Some(event) = next else { break };
                            if !forward(&cancel, &tx, event).await {
                                return;
                            }
                        }
                        warn!(service = %service, "Watch ended, re-subscribing");
                    }
                    Err(e) if e.is_canceled() => return,
                    Err(e) => {
                        warn!(service = %service, attempt, error = %e, "Failed to re-subscribe watch");
                        attempt = attempt.saturating_add(1);
                    }
                }
                resubscribed = true;

                let delay = retry.delay(attempt);
                debug!(service = %service, delay_ms = delay.as_millis() as u64, "Backing off before re-subscribing");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
        rx
    }
}

/// Emit an `Add` for every current instance. False when the consumer is gone
/// or the watch was cancelled.
async fn resync(
    source: &dyn ServiceSource,
    cancel: &CancellationToken,
    service: &str,
    tx: &mpsc::Sender<ServiceEvent>,
) -> bool {
    let instances = match source.resolve_service(cancel, service).await {
        Ok(instances) => instances,
        Err(e) if e.is_canceled() => return false,
        Err(e) if matches!(e.code, codes::SERVICE_NOT_FOUND | codes::NO_AVAILABLE_INSTANCES) => {
            Vec::new()
        }
        Err(e) => {
            warn!(service, error = %e, "Snapshot after re-subscribe failed");
            Vec::new()
        }
    };
    for instance in instances {
        let event = ServiceEvent {
            event_type: ServiceEventType::Add,
            service: service.to_string(),
            instance,
        };
        if !forward(cancel, tx, event).await {
            return false;
        }
    }
    true
}

async fn forward(
    cancel: &CancellationToken,
    tx: &mpsc::Sender<ServiceEvent>,
    event: ServiceEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordError;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hands out pre-built event channels, one per subscription.
    struct ScriptedSource {
        subscriptions: Mutex<Vec<mpsc::Receiver<ServiceEvent>>>,
        snapshot: Vec<ServiceInstance>,
    }

    #[async_trait]
    impl ServiceSource for ScriptedSource {
        async fn watch_service(
            &self,
            _cancel: &CancellationToken,
            _service: &str,
        ) -> Result<mpsc::Receiver<ServiceEvent>> {
            let mut subs = self.subscriptions.lock().unwrap();
            if subs.is_empty() {
                return Err(CoordError::new(codes::CONNECTION_LOST, "no more subscriptions"));
            }
            Ok(subs.remove(0))
        }

        async fn resolve_service(
            &self,
            _cancel: &CancellationToken,
            _service: &str,
        ) -> Result<Vec<ServiceInstance>> {
            Ok(self.snapshot.clone())
        }
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            service_name: "api".into(),
            id: id.into(),
            address: format!("{}:80", id),
            metadata: Default::default(),
            lease_id: None,
        }
    }

    fn event(kind: ServiceEventType, id: &str) -> ServiceEvent {
        ServiceEvent {
            event_type: kind,
            service: "api".into(),
            instance: instance(id),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_and_resyncs() {
        let (first_tx, first_rx) = mpsc::channel(4);
        let (second_tx, second_rx) = mpsc::channel(4);
        let source = Arc::new(ScriptedSource {
            subscriptions: Mutex::new(vec![first_rx, second_rx]),
            snapshot: vec![instance("b")],
        });
        let watch = ResilientWatch::new(source, RetryConfig::default());
        let cancel = CancellationToken::new();
        let mut events = watch.watch(cancel.clone(), "api");

        first_tx.send(event(ServiceEventType::Add, "a")).await.unwrap();
        drop(first_tx);
        second_tx.send(event(ServiceEventType::Delete, "a")).await.unwrap();

        let got: Vec<(ServiceEventType, String)> = vec![
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| (e.event_type, e.instance.id))
        .collect();
        assert_eq!(
            got,
            vec![
                (ServiceEventType::Add, "a".to_string()),
                (ServiceEventType::Add, "b".to_string()),
                (ServiceEventType::Delete, "a".to_string()),
            ]
        );

        cancel.cancel();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_retrying_until_cancelled() {
        let source = Arc::new(ScriptedSource {
            subscriptions: Mutex::new(Vec::new()),
            snapshot: Vec::new(),
        });
        let watch = ResilientWatch::new(source, RetryConfig::default());
        let cancel = CancellationToken::new();
        let mut events = watch.watch(cancel.clone(), "api");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(events.try_recv().is_err());
        cancel.cancel();
        assert!(events.recv().await.is_none());
    }
}
