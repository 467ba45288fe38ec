//! Network quality model and classification.
//!
//! Classification bounds are configuration, not algorithm: the surrounding
//! app tunes [`QualityThresholds`] per deployment. The defaults below are
//! advisory starting points.

use serde::{Deserialize, Serialize};

/// Transport-level statistics sampled from the live peer connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Inter-arrival jitter in milliseconds.
    pub jitter_ms: f64,
    /// Packet loss over the sampling window, 0.0..=100.0.
    pub packet_loss_pct: f64,
    /// Estimated available bandwidth in kbit/s. Zero when unknown.
    pub estimated_bandwidth_kbps: f64,
}

/// Coarse connection-type hint from the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Unknown,
}

/// Classified quality level for one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
}

impl QualityLevel {
    pub fn is_poor(&self) -> bool {
        matches!(self, Self::Poor)
    }
}

/// Classification bounds and suppression pacing.
///
/// A sample is `poor` when any poor bound is crossed, `fair` when any fair
/// bound is crossed, and so on downward; otherwise `excellent`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Packet loss at or above this is `poor`.
    pub poor_packet_loss_pct: f64,
    /// Latency at or above this is `poor`.
    pub poor_latency_ms: f64,
    /// Jitter at or above this is `poor`.
    pub poor_jitter_ms: f64,
    pub fair_packet_loss_pct: f64,
    pub fair_latency_ms: f64,
    pub fair_jitter_ms: f64,
    pub good_packet_loss_pct: f64,
    pub good_latency_ms: f64,
    pub good_jitter_ms: f64,
    /// Consecutive `poor` samples before video suppression is requested.
    pub sustain_samples: u32,
    /// Consecutive non-`poor` samples before re-enable is offered.
    pub recovery_samples: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            poor_packet_loss_pct: 8.0,
            poor_latency_ms: 450.0,
            poor_jitter_ms: 120.0,
            fair_packet_loss_pct: 3.0,
            fair_latency_ms: 250.0,
            fair_jitter_ms: 60.0,
            good_packet_loss_pct: 1.0,
            good_latency_ms: 120.0,
            good_jitter_ms: 30.0,
            sustain_samples: 3,
            recovery_samples: 5,
        }
    }
}

/// Classify one sample against the configured bounds.
pub fn classify(stats: &TransportStats, t: &QualityThresholds) -> QualityLevel {
    if stats.packet_loss_pct >= t.poor_packet_loss_pct
        || stats.latency_ms >= t.poor_latency_ms
        || stats.jitter_ms >= t.poor_jitter_ms
    {
        QualityLevel::Poor
    } else if stats.packet_loss_pct >= t.fair_packet_loss_pct
        || stats.latency_ms >= t.fair_latency_ms
        || stats.jitter_ms >= t.fair_jitter_ms
    {
        QualityLevel::Fair
    } else if stats.packet_loss_pct >= t.good_packet_loss_pct
        || stats.latency_ms >= t.good_latency_ms
        || stats.jitter_ms >= t.good_jitter_ms
    {
        QualityLevel::Good
    } else {
        QualityLevel::Excellent
    }
}

/// Last known quality picture for a live call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkQualityState {
    pub level: QualityLevel,
    pub connection: ConnectionType,
    pub stats: TransportStats,
    /// True once video has been force-disabled due to quality. Sticky:
    /// cleared only by an explicit re-enable.
    pub video_suppressed: bool,
}

/// Action requested by the suppression policy after observing a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionAction {
    /// Sustained poor quality: force video off.
    SuppressVideo,
    /// Quality has recovered for the configured streak; the app may offer
    /// an explicit re-enable. Video is NOT resumed automatically.
    OfferReenable,
}

/// Tracks consecutive-sample streaks and decides when suppression engages.
///
/// Suppression is sticky: once engaged it is never cleared here, only an
/// [`SuppressionAction::OfferReenable`] hint is produced. The owner clears
/// suppression on an explicit user or app action via [`Self::reset`].
#[derive(Debug, Clone, Default)]
pub struct SuppressionPolicy {
    consecutive_poor: u32,
    consecutive_ok: u32,
    suppressed: bool,
    reenable_offered: bool,
}

impl SuppressionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Observe one classified sample and return the action to take, if any.
    pub fn observe(&mut self, level: QualityLevel, t: &QualityThresholds) -> Option<SuppressionAction> {
        if level.is_poor() {
            self.consecutive_poor += 1;
            self.consecutive_ok = 0;
            self.reenable_offered = false;
            if !self.suppressed && self.consecutive_poor >= t.sustain_samples {
                self.suppressed = true;
                return Some(SuppressionAction::SuppressVideo);
            }
        } else {
            self.consecutive_poor = 0;
            self.consecutive_ok += 1;
            if self.suppressed
                && !self.reenable_offered
                && self.consecutive_ok >= t.recovery_samples
            {
                self.reenable_offered = true;
                return Some(SuppressionAction::OfferReenable);
            }
        }
        None
    }

    /// Clear suppression after an explicit re-enable.
    pub fn reset(&mut self) {
        self.suppressed = false;
        self.reenable_offered = false;
        self.consecutive_poor = 0;
        self.consecutive_ok = 0;
    }
}
