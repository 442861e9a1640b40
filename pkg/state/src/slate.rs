use async_trait::async_trait;
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::fmt::Display;
use std::sync::Arc;
use tracing::info;

use crate::backend::KvBackend;
use crate::error::{Result, StoreError};

fn backend_err<E: Display>(op: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Backend(format!("SlateDB {} failed: {}", op, e))
}

/// Durable [`KvBackend`] on SlateDB over a local directory.
///
/// Only lease-free keys survive a reopen; the embedded store purges leased
/// ones on open.
#[derive(Clone)]
pub struct SlateBackend {
    db: Db,
}

impl SlateBackend {
    /// Open (or create) the database under `path`.
    pub async fn open(path: &str) -> Result<Self> {
        info!(path, "Opening SlateDB backend");
        std::fs::create_dir_all(path).map_err(|e| {
            StoreError::Backend(format!("failed to create data directory {}: {}", path, e))
        })?;
        let object_store =
            Arc::new(LocalFileSystem::new_with_prefix(path).map_err(backend_err("object store setup"))?);
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(backend_err("open"))?;
        Ok(Self { db })
    }

    /// Flush outstanding writes and close.
    pub async fn close(&self) -> Result<()> {
        info!("Closing SlateDB backend");
        self.db.close().await.map_err(backend_err("close"))
    }
}

#[async_trait]
impl KvBackend for SlateBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map(|_| ())
            .map_err(backend_err("put"))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let found = self.db.get(key.as_bytes()).await.map_err(backend_err("get"))?;
        Ok(found.map(|bytes| bytes.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db
            .delete(key.as_bytes())
            .await
            .map(|_| ())
            .map_err(backend_err("delete"))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(backend_err("scan_prefix"))?;
        let mut pairs = Vec::new();
        while let Some(kv) = iter.next().await.map_err(backend_err("scan"))? {
            pairs.push((String::from_utf8_lossy(&kv.key).into_owned(), kv.value.to_vec()));
        }
        Ok(pairs)
    }
}
