use chrono::Utc;
use pkg_state::{CoordStore, DialConfig, StoreConnector};
use pkg_types::connection::{ConnectionState, ConnectionStatus};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{bounded, cancellable};
use crate::error::{CoordError, Result, codes};

struct ConnectionInner {
    state: ConnectionState,
    client: Option<Arc<dyn CoordStore>>,
    last_ping: Option<chrono::DateTime<Utc>>,
    error: Option<String>,
}

/// Owns the single logical connection to the store.
///
/// State reads are cheap (a std `RwLock` never held across an await);
/// connect and disconnect are serialized by an async mutex so concurrent
/// reconnects don't dial twice.
pub struct ConnectionManager {
    connector: Arc<dyn StoreConnector>,
    config: DialConfig,
    health_check_timeout: Duration,
    inner: RwLock<ConnectionInner>,
    transition: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        config: DialConfig,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            config,
            health_check_timeout,
            inner: RwLock::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                client: None,
                last_ping: None,
                error: None,
            }),
            transition: Mutex::new(()),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.config.endpoints
    }

    /// Dial the store and probe the first endpoint. No-op when connected.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting, None);

        match self.dial(cancel).await {
            Ok(client) => {
                let mut inner = self.write();
                inner.client = Some(client);
                inner.state = ConnectionState::Connected;
                inner.last_ping = Some(Utc::now());
                inner.error = None;
                drop(inner);
                info!(endpoints = ?self.config.endpoints, "Connected to coordination store");
                Ok(())
            }
            Err(e) => {
                warn!(endpoints = ?self.config.endpoints, error = %e, "Failed to connect to coordination store");
                self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn dial(&self, cancel: &CancellationToken) -> Result<Arc<dyn CoordStore>> {
        let first = self.config.endpoints.first().cloned().ok_or_else(|| {
            CoordError::new(codes::MISSING_ENDPOINTS, "no endpoints configured")
        })?;
        let timeout = self.config.dial_timeout;

        let attempt = async {
            let client = self.connector.connect(&self.config).await.map_err(|e| {
                CoordError::wrap(codes::CONNECTION_FAILED, "failed to dial store", e)
            })?;
            client.status(&first).await.map_err(|e| {
                CoordError::wrap(
                    codes::CONNECTION_FAILED,
                    format!("status probe of {} failed", first),
                    e,
                )
            })?;
            Ok(client)
        };

        let limited = async {
            tokio::time::timeout(timeout, attempt).await.unwrap_or_else(|_| {
                Err(CoordError::new(
                    codes::CONNECTION_TIMEOUT,
                    format!("connect timed out after {}ms", timeout.as_millis()),
                ))
            })
        };
        cancellable(cancel, limited).await
    }

    /// Drop the transport. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let mut inner = self.write();
        let had_client = inner.client.take().is_some();
        inner.state = ConnectionState::Closed;
        drop(inner);
        if had_client {
            info!("Disconnected from coordination store");
        }
        Ok(())
    }

    pub async fn reconnect(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Reconnecting to coordination store");
        self.disconnect().await?;
        self.connect(cancel).await
    }

    /// Probe every endpoint. The first failure marks the connection
    /// degraded and is returned as a connection error.
    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        let client = self.client()?;
        for endpoint in &self.config.endpoints {
            let probe = async {
                client.status(endpoint).await.map(|_| ()).map_err(|e| {
                    CoordError::wrap(
                        codes::CONNECTION_LOST,
                        format!("health check of {} failed", endpoint),
                        e,
                    )
                })
            };
            let result = bounded(cancel, self.health_check_timeout, "health check", probe)
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        CoordError::wrap(
                            codes::CONNECTION_TIMEOUT,
                            format!("health check of {} timed out", endpoint),
                            e,
                        )
                    } else {
                        e
                    }
                });
            if let Err(e) = result {
                if !e.is_canceled() {
                    warn!(endpoint = %endpoint, error = %e, "Health check failed");
                    let mut inner = self.write();
                    if inner.client.is_some() {
                        inner.state = ConnectionState::Degraded;
                        inner.error = Some(e.to_string());
                    }
                }
                return Err(e);
            }
        }

        let mut inner = self.write();
        if inner.client.is_some() {
            inner.state = ConnectionState::Connected;
            inner.last_ping = Some(Utc::now());
            inner.error = None;
        }
        debug!("Health check passed");
        Ok(())
    }

    /// Connected or degraded with a live transport.
    pub fn is_connected(&self) -> bool {
        let inner = self.read();
        inner.client.is_some()
            && matches!(
                inner.state,
                ConnectionState::Connected | ConnectionState::Degraded
            )
    }

    /// The current store handle, or a not-connected error.
    pub fn client(&self) -> Result<Arc<dyn CoordStore>> {
        self.read().client.clone().ok_or_else(|| {
            CoordError::new(codes::NOT_CONNECTED, "not connected to coordination store")
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.read();
        ConnectionStatus {
            state: inner.state,
            endpoint: self.config.endpoints.first().cloned(),
            last_ping: inner.last_ping,
            error: inner.error.clone(),
        }
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let mut inner = self.write();
        inner.state = state;
        inner.error = error;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConnectionInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
