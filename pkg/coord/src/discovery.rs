use async_trait::async_trait;
use pkg_constants::coord::WATCH_EVENT_BUFFER;
use pkg_state::{EventType, StoreEvent};
use pkg_types::service::{ServiceEvent, ServiceEventType, ServiceInstance};
use pkg_types::validate::validate_segment;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{decode_record, instance_id_from_key, service_key_prefix, to_instance};
use crate::connection::ConnectionManager;
use crate::context::{bounded, cancellable};
use crate::error::{CoordError, Result, codes, store_err};
use crate::options::DiscoveryOptions;

/// A byte stream to a discovered instance.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type Connection = Box<dyn Transport>;

/// Opens transport connections to instance addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> std::io::Result<Connection>;
}

/// Plain TCP.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> std::io::Result<Connection> {
        let stream = tokio::net::TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Resolves service names to instances and watches them for changes.
pub struct ServiceDiscovery {
    conn: Arc<ConnectionManager>,
    service_prefix: String,
    dialer: Arc<dyn Dialer>,
    /// Parent of every watch loop.
    root: CancellationToken,
}

impl ServiceDiscovery {
    pub fn new(
        conn: Arc<ConnectionManager>,
        service_prefix: impl Into<String>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            conn,
            service_prefix: service_prefix.into(),
            dialer,
            root: CancellationToken::new(),
        }
    }

    /// Every valid instance of `service`.
    ///
    /// No keys at all is `ServiceNotFound`; keys that are all malformed is
    /// `NoAvailableInstances`.
    pub async fn resolve_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<ServiceInstance>> {
        validate_service(service)?;
        let client = self.conn.client()?;
        let prefix = service_key_prefix(&self.service_prefix, service);
        let entries = cancellable(cancel, async {
            client
                .get_prefix(&prefix)
                .await
                .map_err(store_err(codes::DISCOVERY_FAILED, "failed to resolve service"))
        })
        .await?;

        let mut instances = Vec::with_capacity(entries.len());
        let mut seen = 0usize;
        for kv in entries {
            let Some(id) = instance_id_from_key(&prefix, &kv.key) else {
                continue;
            };
            seen += 1;
            match decode_record(&kv.value) {
                Some(record) => instances.push(to_instance(service, id, record, kv.lease)),
                None => warn!(key = %kv.key, "Skipping malformed service record"),
            }
        }

        if seen == 0 {
            return Err(CoordError::new(
                codes::SERVICE_NOT_FOUND,
                format!("service {} not found", service),
            ));
        }
        if instances.is_empty() {
            return Err(CoordError::new(
                codes::NO_AVAILABLE_INSTANCES,
                format!("service {} has no valid instances", service),
            ));
        }
        Ok(instances)
    }

    pub async fn get_service_endpoints(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .resolve_service(cancel, service)
            .await?
            .into_iter()
            .map(|instance| instance.address)
            .collect())
    }

    /// Instances carrying every metadata pair in `opts`.
    pub async fn resolve_matching(
        &self,
        cancel: &CancellationToken,
        service: &str,
        opts: &DiscoveryOptions,
    ) -> Result<Vec<ServiceInstance>> {
        let candidates: Vec<ServiceInstance> = self
            .resolve_service(cancel, service)
            .await?
            .into_iter()
            .filter(|instance| {
                opts.metadata
                    .iter()
                    .all(|(k, v)| instance.metadata.get(k) == Some(v))
            })
            .collect();
        if candidates.is_empty() {
            return Err(CoordError::new(
                codes::NO_AVAILABLE_INSTANCES,
                format!("no instance of {} matches the metadata filter", service),
            ));
        }
        Ok(candidates)
    }

    /// Stream topology changes of `service`.
    ///
    /// The channel closes when the underlying watch ends (store cancel or
    /// connection loss), when `cancel` fires, or when discovery is closed. The
    /// watch is not re-established; see
    /// [`ResilientWatch`](crate::resilient::ResilientWatch) for that.
    pub async fn watch_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<mpsc::Receiver<ServiceEvent>> {
        validate_service(service)?;
        let client = self.conn.client()?;
        let prefix = service_key_prefix(&self.service_prefix, service);
        let mut stream = cancellable(cancel, async {
            client
                .watch(&prefix)
                .await
                .map_err(store_err(codes::DISCOVERY_FAILED, "failed to open watch"))
        })
        .await?;

        let (tx, rx) = mpsc::channel(WATCH_EVENT_BUFFER);
        let caller = cancel.clone();
        let root = self.root.clone();
        let service = service.to_string();
        info!(service = %service, "Watching service");

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = caller.cancelled() => break,
                    _ = root.cancelled() => break,
                    next = stream.next() => next,
                };
                let Some(event) = next else {
                    debug!(service = %service, "Watch stream ended");
                    break;
                };
                let Some(event) = to_service_event(&service, &prefix, event) else {
                    continue;
                };
                let sent = tokio::select! {
                    biased;
                    _ = caller.cancelled() => break,
                    _ = root.cancelled() => break,
                    sent = tx.send(event) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            info!(service = %service, "Service watch closed");
        });
        Ok(rx)
    }

    /// Dial the first reachable candidate, in resolution order.
    pub async fn get_connection(
        &self,
        cancel: &CancellationToken,
        service: &str,
        opts: &DiscoveryOptions,
    ) -> Result<Connection> {
        let candidates = self.resolve_matching(cancel, service, opts).await?;
        debug!(
            service,
            candidates = candidates.len(),
            load_balancer = %opts.load_balancer,
            "Dialing service"
        );

        let mut last_error = None;
        for instance in &candidates {
            let attempt = async {
                self.dialer.dial(&instance.address).await.map_err(|e| {
                    CoordError::wrap(
                        codes::DISCOVERY_FAILED,
                        format!("dial {} failed", instance.address),
                        e,
                    )
                })
            };
            match bounded(cancel, opts.timeout, "dial", attempt).await {
                Ok(conn) => {
                    debug!(service, instance = %instance.id, address = %instance.address, "Connected to instance");
                    return Ok(conn);
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    warn!(service, address = %instance.address, error = %e, "Candidate unreachable, trying next");
                    last_error = Some(e);
                }
            }
        }

        let err = CoordError::new(
            codes::DISCOVERY_FAILED,
            format!(
                "all {} instances of {} are unreachable",
                candidates.len(),
                service
            ),
        );
        Err(match last_error {
            Some(cause) => err.with_source(cause),
            None => err,
        })
    }

    /// End every watch loop.
    pub fn close(&self) {
        self.root.cancel();
    }
}

fn validate_service(service: &str) -> Result<()> {
    validate_segment("service name", service)
        .map_err(|e| CoordError::new(codes::INVALID_CONFIGURATION, e.to_string()))
}

/// Translate a store event into a service event. A put that created the key
/// is `Add`; a later put is `Update`.
fn to_service_event(service: &str, prefix: &str, event: StoreEvent) -> Option<ServiceEvent> {
    let id = instance_id_from_key(prefix, &event.kv.key)?;
    match event.event_type {
        EventType::Put => {
            let Some(record) = decode_record(&event.kv.value) else {
                warn!(key = %event.kv.key, "Skipping malformed service record in watch");
                return None;
            };
            let event_type = if event.kv.create_revision == event.kv.mod_revision {
                ServiceEventType::Add
            } else {
                ServiceEventType::Update
            };
            Some(ServiceEvent {
                event_type,
                service: service.to_string(),
                instance: to_instance(service, id, record, event.kv.lease),
            })
        }
        EventType::Delete => Some(ServiceEvent {
            event_type: ServiceEventType::Delete,
            service: service.to_string(),
            instance: ServiceInstance {
                service_name: service.to_string(),
                id: id.to_string(),
                address: String::new(),
                metadata: Default::default(),
                lease_id: event.kv.lease,
            },
        }),
    }
}
