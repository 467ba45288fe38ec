use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::calls::ledger::{BadgeCounters, CallRecord};
use crate::store::error::{Result, StoreError};
use crate::store::LedgerStore;

/// JSON-on-disk ledger store.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn badges_path(&self) -> PathBuf {
        self.base_path.join("badges.json")
    }

    fn history_path(&self) -> PathBuf {
        self.base_path.join("call_history.json")
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(path, data).await.map_err(StoreError::Io)
    }
}

#[async_trait]
impl LedgerStore for FileStore {
    async fn load_badges(&self) -> Result<HashMap<String, BadgeCounters>> {
        Ok(self.read_json(&self.badges_path()).await?.unwrap_or_default())
    }

    async fn save_badges(&self, badges: &HashMap<String, BadgeCounters>) -> Result<()> {
        self.write_json(&self.badges_path(), badges).await
    }

    async fn load_history(&self) -> Result<Vec<CallRecord>> {
        Ok(self
            .read_json(&self.history_path())
            .await?
            .unwrap_or_default())
    }

    async fn save_history(&self, history: &[CallRecord]) -> Result<()> {
        self.write_json(&self.history_path(), &history).await
    }
}
