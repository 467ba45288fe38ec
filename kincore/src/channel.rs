//! Family-scoped relay channel naming.
//!
//! Channel names are derived deterministically from the family identifier.
//! Raw user text never becomes a channel name.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A relay channel name scoped to one family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Wrap an already-derived channel name, e.g. one read back from a wire
    /// frame or storage. Derivation from user input goes through
    /// [`family_channel`].
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the signaling channel for a family.
///
/// The family id is sanitized to lowercase ASCII alphanumerics and dashes;
/// everything else is dropped.
pub fn family_channel(family_id: &str) -> ChannelName {
    let safe: String = family_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    ChannelName(format!("family-{safe}-rtc"))
}
