//! Threshold events for usage bars and toasts.

use crate::models::{Limit, Resource, TierDefinition, UsageEvent, UsageEventType, UsageRecord};

pub const WARNING_THRESHOLD: f64 = 75.0;
pub const ERROR_THRESHOLD: f64 = 90.0;

/// Percentage of `limit` consumed. `None` for unlimited resources.
///
/// A zero cap reads as 0% while unused and 100% once anything was consumed.
pub fn percentage_used(used: u64, limit: Limit) -> Option<f64> {
    match limit {
        Limit::Unlimited => None,
        Limit::Capped(0) if used == 0 => Some(0.0),
        Limit::Capped(0) => Some(100.0),
        Limit::Capped(max) => Some(used as f64 * 100.0 / max as f64),
    }
}

/// Derive events from a record. Characters, then requests, then voice clones.
pub fn evaluate(record: &UsageRecord, tier: &TierDefinition) -> Vec<UsageEvent> {
    Resource::ALL
        .into_iter()
        .filter_map(|resource| {
            let percentage = percentage_used(record.used(resource), resource.limit_in(tier))?;
            let event_type = if percentage >= ERROR_THRESHOLD {
                UsageEventType::Error
            } else if percentage >= WARNING_THRESHOLD {
                UsageEventType::Warning
            } else {
                return None;
            };
            Some(UsageEvent {
                event_type,
                resource,
                percentage,
                message: message_for(resource, percentage),
                persistent: event_type == UsageEventType::Error,
            })
        })
        .collect()
}

fn message_for(resource: Resource, percentage: f64) -> String {
    let shown = percentage.floor();
    if percentage >= ERROR_THRESHOLD {
        format!(
            "You've reached {}% of your {} limit. Upgrade to continue using the service.",
            shown,
            resource.label()
        )
    } else {
        format!(
            "You're approaching your {} limit ({}% used). Consider upgrading your plan.",
            resource.label(),
            shown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;
    use chrono::{TimeZone, Utc};

    fn tier(chars: Limit, rpm: u64, clones: Limit) -> TierDefinition {
        TierDefinition {
            tier_id: Tier::Pro,
            requests_per_minute: rpm,
            characters_per_month: chars,
            voice_clones: clones,
        }
    }

    fn record(chars: u64, requests: u64, clones: u64) -> UsageRecord {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut r = UsageRecord::new("u1", now, now);
        r.characters_used_this_month = chars;
        r.requests_this_minute.count = requests;
        r.voice_clones_used = clones;
        r
    }

    #[test]
    fn thresholds_are_inclusive() {
        let def = tier(Limit::Capped(1000), 100, Limit::Unlimited);

        let events = evaluate(&record(750, 0, 0), &def);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, UsageEventType::Warning);
        assert_eq!(events[0].percentage, 75.0);
        assert!(!events[0].persistent);

        let events = evaluate(&record(900, 0, 0), &def);
        assert_eq!(events[0].event_type, UsageEventType::Error);
        assert!(events[0].persistent);

        assert!(evaluate(&record(749, 0, 0), &def).is_empty());
    }

    #[test]
    fn just_below_warning_emits_nothing() {
        let def = tier(Limit::Capped(10_000), 100, Limit::Unlimited);
        assert!(evaluate(&record(7_490, 0, 0), &def).is_empty());
    }

    #[test]
    fn events_are_ordered_by_resource() {
        let def = tier(Limit::Capped(100), 10, Limit::Capped(4));
        let events = evaluate(&record(95, 8, 3), &def);
        let resources: Vec<Resource> = events.iter().map(|e| e.resource).collect();
        assert_eq!(
            resources,
            vec![Resource::Characters, Resource::Requests, Resource::VoiceClones]
        );
        assert_eq!(events[1].event_type, UsageEventType::Warning);
        assert_eq!(events[2].event_type, UsageEventType::Warning);
    }

    #[test]
    fn unlimited_and_unused_zero_caps_never_emit() {
        let def = tier(Limit::Unlimited, 10, Limit::Capped(0));
        assert!(evaluate(&record(1_000_000, 0, 0), &def).is_empty());

        let events = evaluate(&record(0, 0, 1), &def);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource, Resource::VoiceClones);
        assert_eq!(events[0].percentage, 100.0);
    }

    #[test]
    fn over_limit_usage_reports_above_hundred() {
        let def = tier(Limit::Capped(100), 10, Limit::Unlimited);
        let events = evaluate(&record(150, 0, 0), &def);
        assert_eq!(events[0].percentage, 150.0);
        assert!(events[0].message.contains("150% of your character limit"));
    }
}
