use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::calls::ledger::{BadgeCounters, CallRecord};
use crate::store::LedgerStore;
use crate::store::error::Result;

/// A simple in-memory store implementation for testing purposes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    badges: Arc<RwLock<HashMap<String, BadgeCounters>>>,
    history: Arc<RwLock<Vec<CallRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load_badges(&self) -> Result<HashMap<String, BadgeCounters>> {
        Ok(self.badges.read().await.clone())
    }

    async fn save_badges(&self, badges: &HashMap<String, BadgeCounters>) -> Result<()> {
        *self.badges.write().await = badges.clone();
        Ok(())
    }

    async fn load_history(&self) -> Result<Vec<CallRecord>> {
        Ok(self.history.read().await.clone())
    }

    async fn save_history(&self, history: &[CallRecord]) -> Result<()> {
        *self.history.write().await = history.to_vec();
        Ok(())
    }
}
