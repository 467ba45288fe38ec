// Re-export core modules for compatibility
pub use kincore::channel;

// Core types are re-exported, but events (with EventBus) remain here for platform-specific functionality
pub mod types {
    pub use kincore::channel::{ChannelName, family_channel};
    pub use kincore::types::*;
    pub mod events;
}

// Platform-specific modules remain here
pub mod calls;
pub mod relay;
pub mod store;
pub mod transport;
pub mod traversal;

pub use calls::{CallManager, CallManagerConfig};
pub use relay::SignalingChannel;
