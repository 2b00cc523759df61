//! Advisory usage events derived from counter state.

use super::usage::Resource;
use serde::{Deserialize, Serialize};

/// Severity of a usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageEventType {
    Success,
    Warning,
    Error,
}

/// One advisory event for the presentation layer. Never persisted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    #[serde(rename = "type")]
    pub event_type: UsageEventType,
    pub resource: Resource,
    pub percentage: f64,
    pub message: String,
    /// Whether the UI should keep the event until dismissed.
    pub persistent: bool,
}
