pub mod channel;
pub mod types;

pub use channel::{ChannelName, family_channel};
