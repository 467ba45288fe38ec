use std::sync::Arc;
use tokio::sync::broadcast;

use crate::calls::ledger::BadgeCounters;
use crate::calls::monitor::HealthState;
use crate::calls::state::CallState;
use crate::relay::ChatMessage;
use kincore::types::{BasicCallMeta, CallId, CallOutcome, EndReason, NetworkQualityState};

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// A new inbound call is ringing.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub meta: BasicCallMeta,
}

/// The live call moved to a new state.
#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub call_id: CallId,
    pub state: CallState,
}

/// A call reached its terminal state and was archived.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: EndReason,
    pub outcome: CallOutcome,
    /// Short human-readable text for the UI, never a raw diagnostic.
    pub message: &'static str,
    pub duration_secs: Option<i64>,
}

/// A family text message arrived on the channel.
#[derive(Debug, Clone)]
pub struct ChatReceived {
    pub message: ChatMessage,
}

/// Connection-health flag changed for the live call.
#[derive(Debug, Clone)]
pub struct HealthChanged {
    pub call_id: CallId,
    pub state: HealthState,
}

/// New quality classification for the live call.
#[derive(Debug, Clone)]
pub struct QualityChanged {
    pub call_id: CallId,
    pub state: NetworkQualityState,
    /// True when quality has recovered enough that the app may offer an
    /// explicit video re-enable action.
    pub reenable_available: bool,
}

/// A badge counter changed.
#[derive(Debug, Clone)]
pub struct BadgeChanged {
    pub conversation: String,
    pub counters: BadgeCounters,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        /// This is the observable surface of the call core for the surrounding app.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Call lifecycle events
    (incoming_call, Arc<IncomingCall>),
    (call_state, Arc<CallStateChanged>),
    (call_ended, Arc<CallEnded>),

    // Conversation events
    (chat_message, Arc<ChatReceived>),
    (badges, Arc<BadgeChanged>),

    // Live-call monitoring events
    (health, Arc<HealthChanged>),
    (quality, Arc<QualityChanged>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
