//! Per-user usage record and quota decisions.

use super::tier::{Limit, Tier, TierDefinition};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    Characters,
    Requests,
    VoiceClones,
}

impl Resource {
    /// Evaluation and reporting order.
    pub const ALL: [Resource; 3] = [Resource::Characters, Resource::Requests, Resource::VoiceClones];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Characters => "characters",
            Resource::Requests => "requests",
            Resource::VoiceClones => "voiceClones",
        }
    }

    /// Human label used in notification messages.
    pub fn label(&self) -> &'static str {
        match self {
            Resource::Characters => "character",
            Resource::Requests => "API request",
            Resource::VoiceClones => "voice clone",
        }
    }

    /// Document path of the counter in a stored record.
    pub fn counter_field(&self) -> &'static str {
        match self {
            Resource::Characters => "characters_used_this_month",
            Resource::Requests => "requests_this_minute.count",
            Resource::VoiceClones => "voice_clones_used",
        }
    }

    /// Field of the resource inside a [`DailyUsage`] entry.
    pub fn history_field(&self) -> &'static str {
        match self {
            Resource::Characters => "characters",
            Resource::Requests => "requests",
            Resource::VoiceClones => "voice_clones",
        }
    }

    pub fn limit_in(&self, tier: &TierDefinition) -> Limit {
        match self {
            Resource::Characters => tier.characters_per_month,
            Resource::Requests => Limit::Capped(tier.requests_per_minute),
            Resource::VoiceClones => tier.voice_clones,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown resource '{0}'")]
pub struct UnknownResource(pub String);

impl FromStr for Resource {
    type Err = UnknownResource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "characters" => Ok(Resource::Characters),
            "requests" | "api_requests" => Ok(Resource::Requests),
            "voiceClones" | "voice_clones" => Ok(Resource::VoiceClones),
            other => Err(UnknownResource(other.to_string())),
        }
    }
}

/// Fixed one-minute request window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteWindow {
    pub count: u64,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub window_start: DateTime<Utc>,
}

/// Days of per-day usage kept on a record, today included.
pub const HISTORY_DAYS: i64 = 30;

/// Key of the daily history entry for `now` (`YYYY-MM-DD`, UTC).
pub fn history_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Units granted on one day, net of refunds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyUsage {
    pub characters: u64,
    pub requests: u64,
    pub voice_clones: u64,
}

impl DailyUsage {
    pub fn amount_mut(&mut self, resource: Resource) -> &mut u64 {
        match resource {
            Resource::Characters => &mut self.characters,
            Resource::Requests => &mut self.requests,
            Resource::VoiceClones => &mut self.voice_clones,
        }
    }
}

/// Usage counters for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub tier: Tier,
    pub characters_used_this_month: u64,
    pub requests_this_minute: MinuteWindow,
    pub voice_clones_used: u64,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub last_character_reset_at: DateTime<Utc>,
    /// Daily usage keyed by [`history_key`]. Sorted oldest first.
    #[serde(default)]
    pub history: BTreeMap<String, DailyUsage>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_utc: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_utc: DateTime<Utc>,
}

impl UsageRecord {
    /// Zeroed record on the free tier. `window_start` is the current minute bucket.
    pub fn new(user_id: &str, window_start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            tier: Tier::Free,
            characters_used_this_month: 0,
            requests_this_minute: MinuteWindow {
                count: 0,
                window_start,
            },
            voice_clones_used: 0,
            last_character_reset_at: now,
            history: BTreeMap::new(),
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn used(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Characters => self.characters_used_this_month,
            Resource::Requests => self.requests_this_minute.count,
            Resource::VoiceClones => self.voice_clones_used,
        }
    }

    pub fn counter_mut(&mut self, resource: Resource) -> &mut u64 {
        match resource {
            Resource::Characters => &mut self.characters_used_this_month,
            Resource::Requests => &mut self.requests_this_minute.count,
            Resource::VoiceClones => &mut self.voice_clones_used,
        }
    }
    /// Add granted units to today's history entry and drop expired days.
    pub fn record_daily(&mut self, resource: Resource, amount: u64, now: DateTime<Utc>) {
        let entry = self.history.entry(history_key(now)).or_default();
        let total = entry.amount_mut(resource);
        *total = total.saturating_add(amount);
        for key in self.stale_history_keys(now) {
            self.history.remove(&key);
        }
    }

    /// Take refunded units back out of today's history entry, saturating at zero.
    pub fn refund_daily(&mut self, resource: Resource, amount: u64, now: DateTime<Utc>) {
        let entry = self.history.entry(history_key(now)).or_default();
        let total = entry.amount_mut(resource);
        *total = total.saturating_sub(amount);
    }

    /// History keys older than the retained [`HISTORY_DAYS`] window.
    pub fn stale_history_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        let oldest = history_key(now - Duration::days(HISTORY_DAYS - 1));
        self.history
            .range(..oldest)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Whether deleting this record loses nothing: an idle free-tier record
    /// without voice clones whose monthly usage has already expired.
    pub fn is_reclaimable(&self, idle_since: DateTime<Utc>, month_start: DateTime<Utc>) -> bool {
        self.updated_utc < idle_since
            && self.tier == Tier::Free
            && self.voice_clones_used == 0
            && (self.characters_used_this_month == 0 || self.last_character_reset_at < month_start)
    }
}

/// One day of the usage history as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageHistoryEntry {
    pub date: String,
    pub characters: u64,
    pub requests: u64,
    pub voice_clones: u64,
}

/// Outcome of an authorization attempt.
///
/// `current` is the post-increment value when allowed and the untouched value
/// when denied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    pub resource: Resource,
    pub current: u64,
    pub limit: Limit,
    pub remaining: Option<u64>,
    pub resets_at: Option<DateTime<Utc>>,
}

impl QuotaDecision {
    pub fn new(
        allowed: bool,
        resource: Resource,
        current: u64,
        limit: Limit,
        resets_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            allowed,
            resource,
            current,
            limit,
            remaining: limit.remaining(current),
            resets_at,
        }
    }

    /// The 429 a boundary layer should return for a denied decision.
    pub fn rejection(&self, now: DateTime<Utc>) -> Option<AppError> {
        if self.allowed {
            return None;
        }

        let retry_after = self
            .resets_at
            .map(|at| (at - now).num_seconds().max(0) as u64);

        let message = match self.resource {
            Resource::Requests => format!("Limited to {} requests per minute", self.limit),
            Resource::Characters => format!(
                "Monthly character limit exceeded: used {} of {}",
                self.current, self.limit
            ),
            Resource::VoiceClones => format!(
                "Voice clone limit exceeded: used {} of {}",
                self.current, self.limit
            ),
        };

        Some(AppError::TooManyRequests(message, retry_after))
    }
}

/// Current usage for every resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounts {
    pub characters: u64,
    pub requests: u64,
    pub voice_clones: u64,
}

/// Remaining allowance for every resource; `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemainingCounts {
    pub characters: Option<u64>,
    pub requests: Option<u64>,
    pub voice_clones: Option<u64>,
}

/// Read-only usage summary for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub user_id: String,
    pub tier: Tier,
    pub limits: TierDefinition,
    pub current: UsageCounts,
    pub remaining: RemainingCounts,
    /// Last [`HISTORY_DAYS`] days with usage, newest first.
    pub history: Vec<UsageHistoryEntry>,
    pub last_updated: DateTime<Utc>,
}

impl UsageStats {
    pub fn from_record(record: &UsageRecord, limits: TierDefinition, now: DateTime<Utc>) -> Self {
        let remaining = |r: Resource| r.limit_in(&limits).remaining(record.used(r));
        let oldest = history_key(now - Duration::days(HISTORY_DAYS - 1));
        let history = record
            .history
            .range(oldest..)
            .rev()
            .map(|(date, day)| UsageHistoryEntry {
                date: date.clone(),
                characters: day.characters,
                requests: day.requests,
                voice_clones: day.voice_clones,
            })
            .collect();
        Self {
            user_id: record.user_id.clone(),
            tier: record.tier,
            limits,
            current: UsageCounts {
                characters: record.characters_used_this_month,
                requests: record.requests_this_minute.count,
                voice_clones: record.voice_clones_used,
            },
            remaining: RemainingCounts {
                characters: remaining(Resource::Characters),
                requests: remaining(Resource::Requests),
                voice_clones: remaining(Resource::VoiceClones),
            },
            history,
            last_updated: record.updated_utc,
        }
    }
}
