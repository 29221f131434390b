use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::footnotes::types::ProgressSnapshot;
use crate::storage::{KvStore, PROGRESS_PREFIX};

/// Durable slot holding one snapshot per document.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, document_id: &str) -> StoreResult<Option<ProgressSnapshot>>;
    async fn save(&self, document_id: &str, snapshot: &ProgressSnapshot) -> StoreResult<()>;
}

/// Snapshot slots in the cnidarium key-value store.
pub struct KvSnapshotStore {
    kv: Arc<KvStore>,
}

impl KvSnapshotStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }
}

fn progress_key(document_id: &str) -> String {
    format!("{}/{}", PROGRESS_PREFIX, document_id)
}

#[async_trait]
impl SnapshotStore for KvSnapshotStore {
    async fn load(&self, document_id: &str) -> StoreResult<Option<ProgressSnapshot>> {
        match self.kv.get_raw(&progress_key(document_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, document_id: &str, snapshot: &ProgressSnapshot) -> StoreResult<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.kv.put_raw(progress_key(document_id), bytes).await
    }
}

/// Single-row-per-document SQL table.
#[derive(Clone)]
pub struct SqlSnapshotStore {
    pool: SqlitePool,
}

impl SqlSnapshotStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect sqlite: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS progress_snapshots (
                document_id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqlSnapshotStore {
    async fn load(&self, document_id: &str) -> StoreResult<Option<ProgressSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM progress_snapshots WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("snapshot")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, document_id: &str, snapshot: &ProgressSnapshot) -> StoreResult<()> {
        let raw = serde_json::to_string(snapshot)?;
        let updated_at = snapshot
            .updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO progress_snapshots (document_id, snapshot, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(document_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at",
        )
        .bind(document_id)
        .bind(raw)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Non-durable store for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slots: RwLock<HashMap<String, ProgressSnapshot>>,
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, document_id: &str) -> StoreResult<Option<ProgressSnapshot>> {
        Ok(self.slots.read().await.get(document_id).cloned())
    }

    async fn save(&self, document_id: &str, snapshot: &ProgressSnapshot) -> StoreResult<()> {
        self.slots
            .write()
            .await
            .insert(document_id.to_string(), snapshot.clone());
        Ok(())
    }
}

/// The SQL table when a database URL is configured, otherwise the KV slot.
pub async fn open_snapshot_store(
    database_url: Option<&str>,
    kv: Arc<KvStore>,
) -> StoreResult<Arc<dyn SnapshotStore>> {
    match database_url {
        Some(url) => {
            info!("progress snapshots stored in sql table");
            Ok(Arc::new(SqlSnapshotStore::connect(url).await?))
        }
        None => {
            info!("progress snapshots stored in kv slots");
            Ok(Arc::new(KvSnapshotStore::new(kv)))
        }
    }
}
