use pkg_types::lease::{LeaseId, lease_hex};
use pkg_types::service::ServiceInstance;
use pkg_types::validate::validate_segment;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{
    decode_record, encode_record, instance_id_from_key, instance_key, service_key_prefix,
    service_name_from_key, to_instance,
};
use crate::connection::ConnectionManager;
use crate::context::cancellable;
use crate::error::{CoordError, Result, codes, store_err};
use crate::lease::{KeepAliveAck, LeaseManager};
use crate::options::RegisterOptions;

/// A registration made through this registry.
#[derive(Debug, Clone)]
struct Registration {
    instance: ServiceInstance,
    lease_id: LeaseId,
    /// Whether the registry granted the lease (and so revokes it).
    owns_lease: bool,
}

type RegistrationTable = Arc<RwLock<HashMap<String, Registration>>>;

/// Binds service instances to lease-backed keys.
///
/// A registration whose lease keepalive ends on its own (the lease expired or
/// was revoked elsewhere) is dropped from the local table; its key is already
/// gone from the store.
pub struct ServiceRegistry {
    conn: Arc<ConnectionManager>,
    leases: Arc<LeaseManager>,
    service_prefix: String,
    default_ttl: i64,
    default_metadata: HashMap<String, String>,
    registrations: RegistrationTable,
}

impl ServiceRegistry {
    pub fn new(
        conn: Arc<ConnectionManager>,
        leases: Arc<LeaseManager>,
        service_prefix: impl Into<String>,
        default_ttl: i64,
        default_metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            conn,
            leases,
            service_prefix: service_prefix.into(),
            default_ttl,
            default_metadata,
            registrations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Write `<prefix>/<service>/<instance>` bound to a lease kept alive in
    /// the background.
    pub async fn register(
        &self,
        cancel: &CancellationToken,
        service: &str,
        instance_id: &str,
        address: &str,
        opts: RegisterOptions,
    ) -> Result<()> {
        validate_names(service, instance_id)?;
        if address.trim().is_empty() {
            return Err(CoordError::new(
                codes::INVALID_CONFIGURATION,
                "service address must not be empty",
            ));
        }
        let key = instance_key(&self.service_prefix, service, instance_id);
        let client = self.conn.client()?;

        let existing = self.read().get(&key).cloned();
        if let Some(existing) = existing {
            let stored = cancellable(cancel, async {
                client
                    .get(&key)
                    .await
                    .map_err(store_err(codes::REGISTRATION_FAILED, "failed to read registration"))
            })
            .await?;
            if stored.is_some_and(|kv| kv.lease == Some(existing.lease_id)) {
                return Err(CoordError::new(
                    codes::ALREADY_REGISTERED,
                    format!("{}/{} is already registered", service, instance_id),
                ));
            }
            warn!(service, instance_id, "Dropping stale local registration");
            self.forget(&key);
        }

        let mut metadata = self.default_metadata.clone();
        metadata.extend(opts.metadata);
        let value = encode_record(address, &metadata).map_err(|e| {
            CoordError::wrap(codes::REGISTRATION_FAILED, "failed to encode registration", e)
        })?;

        let (lease_id, owns_lease, acks) = match opts.lease_id {
            Some(lease) => (lease, false, None),
            None => {
                let ttl = opts.ttl.filter(|t| *t > 0).unwrap_or(self.default_ttl);
                let lease = self.leases.create_lease(cancel, ttl).await.map_err(|e| {
                    CoordError::wrap(codes::REGISTRATION_FAILED, "failed to create registration lease", e)
                })?;
                let acks = match self.leases.keep_alive(cancel, lease).await {
                    Ok(acks) => acks,
                    Err(e) => {
                        self.revoke_quietly(lease).await;
                        return Err(CoordError::wrap(
                            codes::REGISTRATION_FAILED,
                            "failed to start registration keepalive",
                            e,
                        ));
                    }
                };
                (lease, true, Some(acks))
            }
        };

        let written = cancellable(cancel, async {
            client
                .put(&key, &value, Some(lease_id))
                .await
                .map_err(store_err(codes::REGISTRATION_FAILED, "failed to write registration"))
        })
        .await;
        if let Err(e) = written {
            if owns_lease {
                self.revoke_quietly(lease_id).await;
            }
            return Err(e);
        }

        let instance = ServiceInstance {
            service_name: service.to_string(),
            id: instance_id.to_string(),
            address: address.to_string(),
            metadata,
            lease_id: Some(lease_id),
        };
        self.write().insert(
            key.clone(),
            Registration {
                instance,
                lease_id,
                owns_lease,
            },
        );
        if let Some(acks) = acks {
            tokio::spawn(watch_registration_lease(
                self.registrations.clone(),
                key,
                lease_id,
                acks,
            ));
        }
        info!(service, instance_id, address, lease = %lease_hex(lease_id), "Service registered");
        Ok(())
    }

    /// Delete the registration key, revoking its lease when this registry
    /// granted it.
    pub async fn deregister(
        &self,
        cancel: &CancellationToken,
        service: &str,
        instance_id: &str,
    ) -> Result<()> {
        validate_names(service, instance_id)?;
        let key = instance_key(&self.service_prefix, service, instance_id);
        let client = self.conn.client()?;

        let removed = cancellable(cancel, async {
            client.delete(&key).await.map_err(store_err(
                codes::DEREGISTRATION_FAILED,
                "failed to delete registration",
            ))
        })
        .await?;

        let local = self.write().remove(&key);
        if let Some(registration) = &local {
            if registration.owns_lease {
                self.revoke_quietly(registration.lease_id).await;
            }
        }
        if !removed && local.is_none() {
            return Err(CoordError::new(
                codes::NOT_REGISTERED,
                format!("{}/{} is not registered", service, instance_id),
            ));
        }
        info!(service, instance_id, "Service deregistered");
        Ok(())
    }

    /// Deregister then register. The instance is briefly absent in between.
    pub async fn update_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
        instance_id: &str,
        address: &str,
        opts: RegisterOptions,
    ) -> Result<()> {
        match self.deregister(cancel, service, instance_id).await {
            Ok(()) => {}
            Err(e) if e.code == codes::NOT_REGISTERED => {}
            Err(e) => return Err(e),
        }
        self.register(cancel, service, instance_id, address, opts).await
    }

    /// Names of every service with at least one instance key.
    pub async fn list_services(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let client = self.conn.client()?;
        let root = format!("{}/", self.service_prefix);
        let entries = cancellable(cancel, async {
            client
                .get_prefix(&root)
                .await
                .map_err(store_err(codes::DISCOVERY_FAILED, "failed to list services"))
        })
        .await?;
        let names: BTreeSet<String> = entries
            .iter()
            .filter_map(|kv| service_name_from_key(&self.service_prefix, &kv.key))
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Every parseable instance of `service`. Malformed records are skipped.
    pub async fn get_service_instances(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<ServiceInstance>> {
        let client = self.conn.client()?;
        let prefix = service_key_prefix(&self.service_prefix, service);
        let entries = cancellable(cancel, async {
            client
                .get_prefix(&prefix)
                .await
                .map_err(store_err(codes::DISCOVERY_FAILED, "failed to read service instances"))
        })
        .await?;

        let mut instances = Vec::with_capacity(entries.len());
        for kv in entries {
            let Some(id) = instance_id_from_key(&prefix, &kv.key) else {
                continue;
            };
            match decode_record(&kv.value) {
                Some(record) => instances.push(to_instance(service, id, record, kv.lease)),
                None => warn!(key = %kv.key, "Skipping malformed service record"),
            }
        }
        Ok(instances)
    }

    /// Instances registered through this registry.
    pub fn registrations(&self) -> Vec<ServiceInstance> {
        let mut out: Vec<ServiceInstance> =
            self.read().values().map(|r| r.instance.clone()).collect();
        out.sort_by(|a, b| (&a.service_name, &a.id).cmp(&(&b.service_name, &b.id)));
        out
    }

    /// Deregister everything registered here, best-effort.
    pub async fn close(&self) {
        let registered: Vec<(String, String)> = self
            .read()
            .values()
            .map(|r| (r.instance.service_name.clone(), r.instance.id.clone()))
            .collect();
        let cancel = CancellationToken::new();
        for (service, id) in registered {
            if let Err(e) = self.deregister(&cancel, &service, &id).await {
                warn!(service = %service, instance_id = %id, error = %e, "Failed to deregister on close");
                let key = instance_key(&self.service_prefix, &service, &id);
                self.forget(&key);
            }
        }
    }

    fn forget(&self, key: &str) {
        if let Some(registration) = self.write().remove(key) {
            if registration.owns_lease {
                self.leases.stop_keep_alive(registration.lease_id);
            }
        }
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        if let Err(e) = self.leases.revoke_lease(&CancellationToken::new(), lease).await {
            warn!(lease = %lease_hex(lease), error = %e, "Failed to revoke registration lease");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.registrations.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Registration>> {
        self.registrations.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drain renewal acks; when the keepalive ends, drop the registration if it
/// is still the one bound to `lease`. Deregistration removes the record
/// before stopping the keepalive, so only a lost lease gets here with the
/// record in place.
async fn watch_registration_lease(
    registrations: RegistrationTable,
    key: String,
    lease: LeaseId,
    mut acks: mpsc::Receiver<KeepAliveAck>,
) {
    while acks.recv().await.is_some() {}
    let mut table = registrations.write().unwrap_or_else(|e| e.into_inner());
    if table.get(&key).is_some_and(|r| r.lease_id == lease) {
        table.remove(&key);
        warn!(key = %key, lease = %lease_hex(lease), "Registration lost with its lease");
    }
}

fn validate_names(service: &str, instance_id: &str) -> Result<()> {
    validate_segment("service name", service)
        .and_then(|_| validate_segment("instance id", instance_id))
        .map_err(|e| CoordError::new(codes::INVALID_CONFIGURATION, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::{CoordStore, DialConfig, EmbeddedConnector, EmbeddedStore};
    use std::time::Duration;

    async fn setup() -> (Arc<EmbeddedStore>, Arc<LeaseManager>, ServiceRegistry) {
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
        let leases = Arc::new(LeaseManager::new(conn.clone()));
        let registry = ServiceRegistry::new(
            conn,
            leases.clone(),
            "/services",
            30,
            HashMap::from([("zone".to_string(), "a".to_string())]),
        );
        (store, leases, registry)
    }

    #[tokio::test]
    async fn test_register_writes_json_under_lease() {
        let (store, leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .register(
                &cancel,
                "api",
                "i-1",
                "10.0.0.1:80",
                RegisterOptions::default().with_metadata("version", "2"),
            )
            .await
            .unwrap();

        let kv = store.get("/services/api/i-1").await.unwrap().unwrap();
        let record = decode_record(&kv.value).unwrap();
        assert_eq!(record.address, "10.0.0.1:80");
        assert_eq!(record.metadata.get("zone").map(String::as_str), Some("a"));
        assert_eq!(record.metadata.get("version").map(String::as_str), Some("2"));
        let lease = kv.lease.unwrap();
        assert!(leases.has_keep_alive(lease));
    }

    #[tokio::test]
    async fn test_registration_metadata_wins_over_default() {
        let (_store, _leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .register(
                &cancel,
                "api",
                "i-1",
                "h:1",
                RegisterOptions::default().with_metadata("zone", "b"),
            )
            .await
            .unwrap();
        let instances = registry.get_service_instances(&cancel, "api").await.unwrap();
        assert_eq!(instances[0].metadata.get("zone").map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn test_double_register_is_rejected() {
        let (_store, _leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap();
        let err = registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::ALREADY_REGISTERED);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_deregister_revokes_owned_lease() {
        let (store, _leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap();
        let lease = store.get("/services/api/i-1").await.unwrap().unwrap().lease.unwrap();

        registry.deregister(&cancel, "api", "i-1").await.unwrap();
        assert!(store.get("/services/api/i-1").await.unwrap().is_none());
        assert!(store.time_to_live(lease).await.unwrap().is_none());

        let err = registry.deregister(&cancel, "api", "i-1").await.unwrap_err();
        assert_eq!(err.code, codes::NOT_REGISTERED);
    }

    #[tokio::test]
    async fn test_caller_lease_is_left_alone() {
        let (store, leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        let lease = leases.create_lease(&cancel, 30).await.unwrap();
        registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default().with_lease(lease))
            .await
            .unwrap();
        assert!(!leases.has_keep_alive(lease));

        registry.deregister(&cancel, "api", "i-1").await.unwrap();
        assert!(store.time_to_live(lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_with_unknown_lease_fails() {
        let (store, leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        let err = registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default().with_lease(0x7777))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::REGISTRATION_FAILED);
        assert!(leases.managed_leases().is_empty());
        assert!(store.leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_skips_malformed_records() {
        let (store, _leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap();
        store.put("/services/api/broken", b"{oops", None).await.unwrap();
        store.put("/services/api/legacy", b"h:2", None).await.unwrap();
        store.put("/services/web/w-1", b"h:3", None).await.unwrap();

        let instances = registry.get_service_instances(&cancel, "api").await.unwrap();
        let ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "legacy"]);

        let services = registry.list_services(&cancel).await.unwrap();
        assert_eq!(services, vec!["api".to_string(), "web".to_string()]);
    }

    #[tokio::test]
    async fn test_update_service_moves_address() {
        let (_store, _leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .update_service(&cancel, "api", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap();
        registry
            .update_service(&cancel, "api", "i-1", "h:9", RegisterOptions::default())
            .await
            .unwrap();
        let instances = registry.get_service_instances(&cancel, "api").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].address, "h:9");
        assert_eq!(registry.registrations().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let (_store, _leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        let err = registry
            .register(&cancel, "a/b", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        let err = registry
            .register(&cancel, "api", "i-1", "", RegisterOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_survives_short_outage() {
        let (store, _leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let instances = registry.get_service_instances(&cancel, "api").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(registry.registrations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_drops_local_registration() {
        let (store, leases, registry) = setup().await;
        let cancel = CancellationToken::new();
        registry
            .register(
                &cancel,
                "api",
                "i-1",
                "h:1",
                RegisterOptions::default().with_ttl(2),
            )
            .await
            .unwrap();

        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        store.set_available(true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.registrations().is_empty());
        assert!(leases.managed_leases().is_empty());
        assert!(store.get("/services/api/i-1").await.unwrap().is_none());

        // Nothing stale blocks a fresh registration.
        registry
            .register(&cancel, "api", "i-1", "h:1", RegisterOptions::default())
            .await
            .unwrap();
        assert_eq!(registry.registrations().len(), 1);
    }
}
