pub mod call;
pub mod quality;

pub use call::{
    BasicCallMeta, CallId, CallKind, CallOutcome, CallRole, DeviceId, EndReason, Participants,
};
pub use quality::{
    ConnectionType, NetworkQualityState, QualityLevel, QualityThresholds, SuppressionAction,
    SuppressionPolicy, TransportStats,
};
