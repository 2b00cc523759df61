//! Domain models for usage-service.

mod event;
mod tier;
mod usage;

pub use event::{UsageEvent, UsageEventType};
pub use tier::{Limit, Tier, TierDefinition};
pub use usage::{
    history_key, DailyUsage, MinuteWindow, QuotaDecision, RemainingCounts, Resource,
    UnknownResource, UsageCounts, UsageHistoryEntry, UsageRecord, UsageStats, HISTORY_DAYS,
};
