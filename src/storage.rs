use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use cnidarium::{StateDelta, StateRead, StateWrite, Storage};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

// Key prefixes have no trailing slash (cnidarium convention)
const BLOB_PREFIX: &str = "blob";
pub(crate) const PROGRESS_PREFIX: &str = "progress";

/// Footnote input of a document run.
pub fn footnotes_key(document_id: &str) -> String {
    format!("footnotes/{}.json", document_id)
}

/// Final `{status, verifications}` of a document run.
pub fn results_key(document_id: &str) -> String {
    format!("results/{}.json", document_id)
}

/// Opaque key-value blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

pub async fn put_json<T: Serialize + Sync>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    store.put(key, serde_json::to_vec(value)?).await
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// cnidarium-backed key-value store. Holds both the blob namespace and the
/// progress snapshot slots.
pub struct KvStore {
    storage: Storage,
    /// Commits must be built on the latest snapshot, so writes go one at a time.
    write_lock: Mutex<()>,
}

impl KvStore {
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let prefixes = vec![BLOB_PREFIX.to_string(), PROGRESS_PREFIX.to_string()];
        let storage = Storage::load(data_dir.to_path_buf(), prefixes)
            .await
            .context("Failed to init cnidarium storage")?;
        Ok(Self {
            storage,
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) async fn get_raw(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let snapshot = self.storage.latest_snapshot();
        Ok(snapshot.get_raw(key).await?)
    }

    pub(crate) async fn put_raw(&self, key: String, value: Vec<u8>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut delta = StateDelta::new(self.storage.latest_snapshot());
        delta.put_raw(key, value);
        self.storage.commit(delta).await?;
        Ok(())
    }

    async fn delete_raw(&self, key: String) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut delta = StateDelta::new(self.storage.latest_snapshot());
        delta.delete(key);
        self.storage.commit(delta).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let snapshot = self.storage.latest_snapshot();
        let mut stream = snapshot.prefix_raw(prefix);
        let mut keys = Vec::new();
        while let Some(entry) = stream.next().await {
            match entry {
                Ok((key, _)) => keys.push(key),
                Err(e) => warn!("Error reading key stream: {}", e),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn blob_key(key: &str) -> String {
    format!("{}/{}", BLOB_PREFIX, key)
}

#[async_trait]
impl BlobStore for KvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_raw(&blob_key(key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let size = value.len();
        self.put_raw(blob_key(key), value).await?;
        debug!(key, size, "blob stored");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let namespace = format!("{}/", BLOB_PREFIX);
        let keys = self.keys_with_prefix(&blob_key(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&namespace).map(str::to_string))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if self.get(key).await?.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.delete_raw(blob_key(key)).await?;
        debug!(key, "blob deleted");
        Ok(())
    }
}

/// In-process blob store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}
