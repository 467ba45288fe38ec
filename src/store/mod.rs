//! Persistent local store for ledger state.
//!
//! Badge counters and call history survive restarts through a
//! [`LedgerStore`]. Writes are single-writer per logical key: only the
//! ledger persists these keys, which avoids lost-update races with the rest
//! of the app's storage.

pub mod error;
pub mod filestore;
pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::calls::ledger::{BadgeCounters, CallRecord};

pub use error::{Result, StoreError};
pub use filestore::FileStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_badges(&self) -> Result<HashMap<String, BadgeCounters>>;
    async fn save_badges(&self, badges: &HashMap<String, BadgeCounters>) -> Result<()>;
    async fn load_history(&self) -> Result<Vec<CallRecord>>;
    async fn save_history(&self, history: &[CallRecord]) -> Result<()>;
}
