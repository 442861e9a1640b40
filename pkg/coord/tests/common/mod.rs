#![allow(dead_code)]

use pkg_coord::{CoordManager, ManagerOptions};
use pkg_state::{EmbeddedConnector, EmbeddedStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options for tests: one endpoint, no background health checks.
pub fn options() -> ManagerOptions {
    ManagerOptions::builder()
        .with_endpoints(["embedded:2379"])
        .with_dial_timeout(Duration::from_secs(1))
        .with_health_check(Duration::ZERO, Duration::from_millis(500))
        .build()
        .expect("valid test options")
}

pub async fn store() -> Arc<EmbeddedStore> {
    init_tracing();
    EmbeddedStore::in_memory().await.expect("in-memory store")
}

/// A started manager over `store`, standing in for one process.
pub async fn process(store: &Arc<EmbeddedStore>) -> Arc<CoordManager> {
    let connector = Arc::new(EmbeddedConnector::new(store.clone()));
    let manager = CoordManager::new(options(), connector).expect("manager");
    manager
        .start(&CancellationToken::new())
        .await
        .expect("manager start");
    manager
}
