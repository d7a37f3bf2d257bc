//! Durable storage for pools and router interface tables

use crate::pool::PoolSnapshot;
use crate::Result;
use async_trait::async_trait;
use ipam_api::{InterfaceRecord, PoolId, RouterId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Persisted interface table of one router
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub router: RouterId,
    pub interfaces: Vec<InterfaceRecord>,
}

/// Everything a store holds, as returned on startup
#[derive(Clone, Debug, Default)]
pub struct StoredState {
    /// Ordered by pool sequence
    pub pools: Vec<PoolSnapshot>,
    pub routers: Vec<RouterSnapshot>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn save_pool(&self, snapshot: &PoolSnapshot) -> Result<()>;
    async fn remove_pool(&self, id: PoolId) -> Result<()>;
    async fn save_router(&self, snapshot: &RouterSnapshot) -> Result<()>;
    async fn remove_router(&self, id: RouterId) -> Result<()>;
    async fn load(&self) -> Result<StoredState>;
}

/// Store that keeps state for the lifetime of the process only
#[derive(Default)]
pub struct MemoryStore {
    pools: RwLock<HashMap<PoolId, PoolSnapshot>>,
    routers: RwLock<HashMap<RouterId, RouterSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_pool(&self, snapshot: &PoolSnapshot) -> Result<()> {
        self.pools
            .write()
            .await
            .insert(snapshot.record.id, snapshot.clone());
        Ok(())
    }

    async fn remove_pool(&self, id: PoolId) -> Result<()> {
        self.pools.write().await.remove(&id);
        Ok(())
    }

    async fn save_router(&self, snapshot: &RouterSnapshot) -> Result<()> {
        self.routers
            .write()
            .await
            .insert(snapshot.router, snapshot.clone());
        Ok(())
    }

    async fn remove_router(&self, id: RouterId) -> Result<()> {
        self.routers.write().await.remove(&id);
        Ok(())
    }

    async fn load(&self) -> Result<StoredState> {
        let mut pools: Vec<PoolSnapshot> = self.pools.read().await.values().cloned().collect();
        pools.sort_by_key(|p| p.record.sequence);
        let routers = self.routers.read().await.values().cloned().collect();
        Ok(StoredState { pools, routers })
    }
}

/// Store writing one JSON document per pool and per router
///
/// Layout under the root directory:
/// - `pools/<pool id>.json`
/// - `routers/<router id>.json`
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("pools")).await?;
        fs::create_dir_all(root.join("routers")).await?;
        debug!("Opened JSON store at {}", root.display());
        Ok(Self { root })
    }

    fn pool_path(&self, id: PoolId) -> PathBuf {
        self.root.join("pools").join(format!("{}.json", id))
    }

    fn router_path(&self, id: RouterId) -> PathBuf {
        self.root.join("routers").join(format!("{}.json", id))
    }

    /// Write to a sibling temp file and rename it over the target
    async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_dir<T: for<'de> Deserialize<'de>>(dir: &Path) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!("Skipping unreadable record {}: {}", path.display(), e);
                }
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn save_pool(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        Self::write_atomic(&self.pool_path(snapshot.record.id), bytes).await
    }

    async fn remove_pool(&self, id: PoolId) -> Result<()> {
        Self::remove_if_exists(&self.pool_path(id)).await
    }

    async fn save_router(&self, snapshot: &RouterSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        Self::write_atomic(&self.router_path(snapshot.router), bytes).await
    }

    async fn remove_router(&self, id: RouterId) -> Result<()> {
        Self::remove_if_exists(&self.router_path(id)).await
    }

    async fn load(&self) -> Result<StoredState> {
        let mut pools: Vec<PoolSnapshot> = Self::read_dir(&self.root.join("pools")).await?;
        pools.sort_by_key(|p| p.record.sequence);
        let routers = Self::read_dir(&self.root.join("routers")).await?;
        debug!(
            "Loaded {} pools and {} routers from {}",
            pools.len(),
            routers.len(),
            self.root.display()
        );
        Ok(StoredState { pools, routers })
    }
}
