//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no live call")]
    NoLiveCall,

    #[error("another call is already in progress")]
    Busy,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("relay error: {0}")]
    Relay(#[from] crate::relay::RelayError),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("call coordinator is not running")]
    NotRunning,
}
