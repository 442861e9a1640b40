use chrono::{DateTime, Utc};
use pkg_state::StoreConnector;
use pkg_types::lock::LockInfo;
use pkg_types::connection::ManagerStatus;
use pkg_types::service::{ServiceEvent, ServiceInstance};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::discovery::{Connection, Dialer, ServiceDiscovery, TcpDialer};
use crate::error::{CoordError, Result, codes};
use crate::lease::LeaseManager;
use crate::lock::DistributedLock;
use crate::options::{DiscoveryOptions, ManagerOptions, RegisterOptions};
use crate::registry::ServiceRegistry;
use crate::resilient::ResilientWatch;

/// One initialized set of components sharing a connection.
pub struct Components {
    pub connection: Arc<ConnectionManager>,
    pub leases: Arc<LeaseManager>,
    pub registry: Arc<ServiceRegistry>,
    pub discovery: Arc<ServiceDiscovery>,
    pub locks: Arc<DistributedLock>,
}

impl Components {
    /// Connect, then build the components in dependency order.
    async fn build(
        options: &ManagerOptions,
        connector: Arc<dyn StoreConnector>,
        dialer: Arc<dyn Dialer>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let connection = Arc::new(ConnectionManager::new(
            connector,
            options.dial_config(),
            options.health_check_timeout,
        ));
        connection.connect(cancel).await?;

        let leases = Arc::new(LeaseManager::new(connection.clone()));
        let registry = Arc::new(ServiceRegistry::new(
            connection.clone(),
            leases.clone(),
            options.service_prefix.clone(),
            options.default_ttl,
            options.default_metadata.clone(),
        ));
        let discovery = Arc::new(ServiceDiscovery::new(
            connection.clone(),
            options.service_prefix.clone(),
            dialer,
        ));
        let locks = Arc::new(DistributedLock::new(
            connection.clone(),
            leases.clone(),
            options.lock_prefix.clone(),
            options.default_ttl,
            options.try_lock_timeout,
        ));
        Ok(Arc::new(Self {
            connection,
            leases,
            registry,
            discovery,
            locks,
        }))
    }

    /// Locks, registrations, leases, then the connection. Every step runs;
    /// the first error is returned.
    async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        if let Err(e) = self.locks.close().await {
            warn!(error = %e, "Failed to close distributed lock");
            first_error.get_or_insert(e);
        }
        self.registry.close().await;
        self.discovery.close();
        self.leases.close();
        if let Err(e) = self.connection.disconnect().await {
            warn!(error = %e, "Failed to close connection");
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Single entry point over the coordination components.
///
/// Owns one component set at a time and a health-check loop that reconnects
/// on connection failures. The loop holds only a weak reference, so dropping
/// the last handle stops it.
pub struct CoordManager {
    connector: Arc<dyn StoreConnector>,
    dialer: Arc<dyn Dialer>,
    options: RwLock<ManagerOptions>,
    components: RwLock<Option<Arc<Components>>>,
    ready: AtomicBool,
    started_at: DateTime<Utc>,
    health: Mutex<Option<CancellationToken>>,
    /// Serializes start, close, restart and reconfiguration.
    lifecycle: tokio::sync::Mutex<()>,
}

impl CoordManager {
    pub fn new(options: ManagerOptions, connector: Arc<dyn StoreConnector>) -> Result<Arc<Self>> {
        Self::with_dialer(options, connector, Arc::new(TcpDialer))
    }

    pub fn with_dialer(
        mut options: ManagerOptions,
        connector: Arc<dyn StoreConnector>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        Ok(Arc::new(Self {
            connector,
            dialer,
            options: RwLock::new(options),
            components: RwLock::new(None),
            ready: AtomicBool::new(false),
            started_at: Utc::now(),
            health: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }))
    }

    /// Connect, initialize every component and start health checking.
    /// No-op when already started.
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        let options = self.options();
        let components =
            Components::build(&options, self.connector.clone(), self.dialer.clone(), cancel).await?;
        self.install(components);
        self.spawn_health_loop(&options);
        info!(endpoints = ?options.endpoints, "Coordination manager started");
        Ok(())
    }

    /// Stop health checking and shut every component down. Safe to call
    /// more than once.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_health_loop();
        self.ready.store(false, Ordering::SeqCst);
        let components = self.write_components().take();
        match components {
            Some(components) => {
                let result = components.shutdown().await;
                info!("Coordination manager closed");
                result
            }
            None => Ok(()),
        }
    }

    /// Tear the components down and build them again with the current
    /// options.
    pub async fn restart(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_health_loop();
        self.ready.store(false, Ordering::SeqCst);
        if let Some(old) = self.write_components().take() {
            if let Err(e) = old.shutdown().await {
                warn!(error = %e, "Error while shutting down for restart");
            }
        }
        let options = self.options();
        let components =
            Components::build(&options, self.connector.clone(), self.dialer.clone(), cancel).await?;
        self.install(components);
        self.spawn_health_loop(&options);
        info!("Coordination manager restarted");
        Ok(())
    }

    /// Swap in new options. A change to endpoints, dial timeout or
    /// credentials rebuilds the components on a new connection; if that
    /// fails the previous configuration and components stay in place.
    /// Other changes are stored and take effect on the next restart, except
    /// the health-check interval which applies immediately.
    pub async fn update_configuration(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        mut new_options: ManagerOptions,
    ) -> Result<()> {
        new_options.validate()?;
        let _lifecycle = self.lifecycle.lock().await;
        let old_options = self.options();
        let running = self.is_ready();

        if !running || !old_options.connection_changed(&new_options) {
            *self.write_options() = new_options.clone();
            if running {
                self.spawn_health_loop(&new_options);
            }
            info!("Configuration updated without reconnecting");
            return Ok(());
        }

        let fresh = match Components::build(
            &new_options,
            self.connector.clone(),
            self.dialer.clone(),
            cancel,
        )
        .await
        {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(error = %e, "Reconfiguration failed, keeping previous configuration");
                return Err(e);
            }
        };

        let old = self.write_components().replace(fresh);
        *self.write_options() = new_options.clone();
        self.spawn_health_loop(&new_options);
        if let Some(old) = old {
            if let Err(e) = old.shutdown().await {
                warn!(error = %e, "Error while shutting down previous components");
            }
        }
        info!(endpoints = ?new_options.endpoints, "Configuration updated and reconnected");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> ManagerOptions {
        self.options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The active component set.
    pub fn components(&self) -> Result<Arc<Components>> {
        self.components
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CoordError::new(codes::INVALID_STATE, "coordination manager is not started"))
    }

    pub fn status(&self) -> ManagerStatus {
        let connection = match self.components() {
            Ok(components) => components.connection.status(),
            Err(_) => pkg_types::connection::ConnectionStatus {
                state: pkg_types::connection::ConnectionState::Closed,
                endpoint: self.options().endpoints.first().cloned(),
                last_ping: None,
                error: None,
            },
        };
        ManagerStatus {
            ready: self.is_ready(),
            connected: self
                .components()
                .map(|c| c.connection.is_connected())
                .unwrap_or(false),
            started_at: self.started_at,
            connection,
        }
    }

    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        self.components()?.connection.health_check(cancel).await
    }

    // Registry

    pub async fn register(
        &self,
        cancel: &CancellationToken,
        service: &str,
        instance_id: &str,
        address: &str,
        opts: RegisterOptions,
    ) -> Result<()> {
        self.components()?
            .registry
            .register(cancel, service, instance_id, address, opts)
            .await
    }

    pub async fn deregister(&self, cancel: &CancellationToken, service: &str, instance_id: &str) -> Result<()> {
        self.components()?
            .registry
            .deregister(cancel, service, instance_id)
            .await
    }

    pub async fn update_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
        instance_id: &str,
        address: &str,
        opts: RegisterOptions,
    ) -> Result<()> {
        self.components()?
            .registry
            .update_service(cancel, service, instance_id, address, opts)
            .await
    }

    pub async fn list_services(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.components()?.registry.list_services(cancel).await
    }

    pub async fn get_service_instances(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<ServiceInstance>> {
        self.components()?
            .registry
            .get_service_instances(cancel, service)
            .await
    }

    // Discovery

    pub async fn get_service_endpoints(&self, cancel: &CancellationToken, service: &str) -> Result<Vec<String>> {
        self.components()?
            .discovery
            .get_service_endpoints(cancel, service)
            .await
    }

    pub async fn resolve_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<ServiceInstance>> {
        self.components()?
            .discovery
            .resolve_service(cancel, service)
            .await
    }

    pub async fn watch_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<mpsc::Receiver<ServiceEvent>> {
        self.components()?
            .discovery
            .watch_service(cancel, service)
            .await
    }

    /// A watch that survives stream loss by re-subscribing with the
    /// configured backoff.
    pub fn resilient_watch(
        &self,
        cancel: CancellationToken,
        service: &str,
    ) -> Result<mpsc::Receiver<ServiceEvent>> {
        let discovery = self.components()?.discovery.clone();
        let watch = ResilientWatch::new(discovery, self.options().retry);
        Ok(watch.watch(cancel, service))
    }

    pub async fn get_connection(
        &self,
        cancel: &CancellationToken,
        service: &str,
        opts: &DiscoveryOptions,
    ) -> Result<Connection> {
        self.components()?
            .discovery
            .get_connection(cancel, service, opts)
            .await
    }

    // Locks

    pub async fn lock(&self, cancel: &CancellationToken, key: &str, ttl: i64) -> Result<()> {
        self.components()?.locks.lock(cancel, key, ttl).await
    }

    pub async fn try_lock(&self, cancel: &CancellationToken, key: &str, ttl: i64) -> Result<bool> {
        self.components()?.locks.try_lock(cancel, key, ttl).await
    }

    pub async fn unlock(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        self.components()?.locks.unlock(cancel, key).await
    }

    pub async fn refresh_lock(&self, cancel: &CancellationToken, key: &str, ttl: i64) -> Result<()> {
        self.components()?.locks.refresh(cancel, key, ttl).await
    }

    pub async fn is_locked(&self, cancel: &CancellationToken, key: &str) -> Result<bool> {
        self.components()?.locks.is_locked(cancel, key).await
    }

    pub async fn get_lock_info(&self, cancel: &CancellationToken, key: &str) -> Result<LockInfo> {
        self.components()?.locks.get_lock_info(cancel, key).await
    }

    fn install(&self, components: Arc<Components>) {
        *self.write_components() = Some(components);
        self.ready.store(true, Ordering::SeqCst);
    }

    fn spawn_health_loop(self: &Arc<Self>, options: &ManagerOptions) {
        self.stop_health_loop();
        let interval = options.health_check_interval;
        if interval.is_zero() {
            debug!("Health checking disabled");
            return;
        }
        let token = CancellationToken::new();
        *self.health.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !supervise(&manager, &token).await {
                    break;
                }
            }
            debug!("Health-check loop stopped");
        });
    }

    fn stop_health_loop(&self) {
        if let Some(token) = self.health.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    fn write_options(&self) -> std::sync::RwLockWriteGuard<'_, ManagerOptions> {
        self.options.write().unwrap_or_else(|e| e.into_inner())
    }

    fn write_components(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Components>>> {
        self.components.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// One health-check round. Returns false once the manager is gone.
async fn supervise(manager: &Weak<CoordManager>, token: &CancellationToken) -> bool {
    let Some(manager) = manager.upgrade() else {
        return false;
    };
    let Ok(components) = manager.components() else {
        return true;
    };
    let retry = manager.options().retry;
    drop(manager);

    let err = match components.connection.health_check(token).await {
        Ok(()) => return true,
        Err(e) if e.is_canceled() => return false,
        Err(e) => e,
    };
    if !err.is_connection() {
        debug!(error = %err, "Health check failed with a non-connection error");
        return true;
    }

    warn!(error = %err, "Health check failed, reconnecting");
    for attempt in 0..=retry.max_retries {
        match components.connection.reconnect(token).await {
            Ok(()) => {
                info!(attempt, "Reconnected to coordination store");
                return true;
            }
            Err(e) if e.is_canceled() => return false,
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect failed");
                tokio::select! {
                    _ = token.cancelled() => return false,
                    _ = tokio::time::sleep(retry.delay(attempt)) => {}
                }
            }
        }
    }
    error!(
        attempts = retry.max_retries + 1,
        "Giving up reconnecting until the next health check"
    );
    true
}
