//! Call history and badge counters.
//!
//! A pure event consumer: terminal call transitions append to a bounded
//! history, inbound messages and missed calls bump per-conversation badge
//! counters. Counts are event-sourced: incremented, decremented, and
//! cleared by discrete events, persisted after every mutation, and restored
//! verbatim on startup. They are never recomputed from a bulk query while
//! the app is running.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::store::{LedgerStore, StoreError};
use kincore::types::{
    CallId, CallKind, CallOutcome, CallRole, DeviceId, EndReason, NetworkQualityState,
};

/// One archived call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub peer: DeviceId,
    pub kind: CallKind,
    pub role: CallRole,
    pub outcome: CallOutcome,
    pub reason: EndReason,
    /// Whether the call ever reached the active state.
    pub answered: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: Option<i64>,
    /// Last quality picture before the call ended.
    pub quality: NetworkQualityState,
}

impl CallRecord {
    /// An unanswered inbound call counts as missed.
    pub fn is_missed(&self) -> bool {
        self.role == CallRole::Responder
            && !self.answered
            && matches!(self.reason, EndReason::RingTimeout | EndReason::RemoteEnded)
    }
}

/// Per-conversation unread/missed counts. Floored at zero; a restart
/// restores the last persisted values exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeCounters {
    pub unread_messages: u32,
    pub missed_calls: u32,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Call history keeps the most recent N records; the oldest are evicted
    /// first.
    pub history_limit: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { history_limit: 50 }
    }
}

pub struct CallLedger {
    config: LedgerConfig,
    store: Arc<dyn LedgerStore>,
    history: RwLock<VecDeque<CallRecord>>,
    badges: DashMap<String, BadgeCounters>,
    /// Conversation the user is currently viewing, if any. Messages for it
    /// do not increment the unread badge.
    active_conversation: RwLock<Option<String>>,
}

impl CallLedger {
    /// Restore ledger state from the store.
    pub async fn load(
        config: LedgerConfig,
        store: Arc<dyn LedgerStore>,
    ) -> Result<Arc<Self>, StoreError> {
        let badges = DashMap::new();
        for (conversation, counters) in store.load_badges().await? {
            badges.insert(conversation, counters);
        }
        let history: VecDeque<CallRecord> = store.load_history().await?.into();

        Ok(Arc::new(Self {
            config,
            store,
            history: RwLock::new(history),
            badges,
            active_conversation: RwLock::new(None),
        }))
    }

    /// Archive a finished call. Returns the badge update when the call
    /// counted as missed.
    pub async fn record_call(&self, record: CallRecord) -> Option<(String, BadgeCounters)> {
        let mut badge_update = None;
        if record.is_missed() {
            let conversation = record.peer.as_str().to_string();
            let counters = self.bump(&conversation, |c| {
                c.missed_calls = c.missed_calls.saturating_add(1);
            });
            badge_update = Some((conversation, counters));
        }

        {
            let mut history = self.history.write().await;
            history.push_back(record);
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        self.persist_history().await;
        if badge_update.is_some() {
            self.persist_badges().await;
        }
        badge_update
    }

    /// An inbound message arrived. Increments the unread badge unless the
    /// recipient is viewing that conversation.
    pub async fn note_incoming_message(
        &self,
        conversation: &str,
    ) -> Option<(String, BadgeCounters)> {
        if self
            .active_conversation
            .read()
            .await
            .as_deref()
            .is_some_and(|active| active == conversation)
        {
            return None;
        }
        let counters = self.bump(conversation, |c| {
            c.unread_messages = c.unread_messages.saturating_add(1);
        });
        self.persist_badges().await;
        Some((conversation.to_string(), counters))
    }

    /// Explicit decrement event (e.g. a single message marked read).
    pub async fn decrement_unread(&self, conversation: &str) -> (String, BadgeCounters) {
        let counters = self.bump(conversation, |c| {
            c.unread_messages = c.unread_messages.saturating_sub(1);
        });
        self.persist_badges().await;
        (conversation.to_string(), counters)
    }

    /// The recipient opened the conversation: clear its unread count.
    pub async fn clear_unread(&self, conversation: &str) -> (String, BadgeCounters) {
        let counters = self.bump(conversation, |c| c.unread_messages = 0);
        self.persist_badges().await;
        (conversation.to_string(), counters)
    }

    /// The recipient viewed the call history: clear the missed-call count.
    pub async fn clear_missed_calls(&self, conversation: &str) -> (String, BadgeCounters) {
        let counters = self.bump(conversation, |c| c.missed_calls = 0);
        self.persist_badges().await;
        (conversation.to_string(), counters)
    }

    /// Mark which conversation the user is viewing, if any.
    pub async fn set_active_conversation(&self, conversation: Option<String>) {
        *self.active_conversation.write().await = conversation;
    }

    pub fn badges(&self, conversation: &str) -> BadgeCounters {
        self.badges
            .get(conversation)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    pub fn all_badges(&self) -> HashMap<String, BadgeCounters> {
        self.badges
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Most recent call first.
    pub async fn history(&self) -> Vec<CallRecord> {
        let history = self.history.read().await;
        history.iter().rev().cloned().collect()
    }

    fn bump(&self, conversation: &str, f: impl FnOnce(&mut BadgeCounters)) -> BadgeCounters {
        let mut entry = self.badges.entry(conversation.to_string()).or_default();
        f(entry.value_mut());
        *entry.value()
    }

    async fn persist_badges(&self) {
        if let Err(e) = self.store.save_badges(&self.all_badges()).await {
            warn!(target: "Calls/Ledger", "Failed to persist badge counters: {e}");
        }
    }

    async fn persist_history(&self) {
        let snapshot: Vec<CallRecord> = {
            let history = self.history.read().await;
            history.iter().cloned().collect()
        };
        if let Err(e) = self.store.save_history(&snapshot).await {
            warn!(target: "Calls/Ledger", "Failed to persist call history: {e}");
        }
    }
}
