mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{start_time, test_catalog, TestHarness};
use usage_service::models::{Limit, Resource, Tier, UsageEventType, UsageRecord};
use usage_service::services::{Clock, QuotaError, TierCatalog, UsageStore};

fn seed_characters(harness: &TestHarness, user_id: &str, used: u64) {
    let mut record = UsageRecord::new(user_id, start_time(), start_time());
    record.characters_used_this_month = used;
    harness.store.insert(record);
}

// =============================================================================
// Characters
// =============================================================================

#[tokio::test]
async fn characters_within_limit_are_granted_and_counted() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 9_990);

    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 5)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.current, 9_995);
    assert_eq!(decision.limit, Limit::Capped(10_000));
    assert_eq!(decision.remaining, Some(5));
}

#[tokio::test]
async fn characters_over_limit_are_denied_without_mutation() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 9_990);

    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 20)
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.current, 9_990);
    assert_eq!(decision.remaining, Some(10));

    let record = harness.store.get("u1", start_time()).await.unwrap();
    assert_eq!(record.characters_used_this_month, 9_990);
}

#[tokio::test]
async fn exact_fit_is_granted_and_next_unit_denied() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 9_990);

    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 10)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, Some(0));

    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 1)
        .await
        .unwrap();
    assert!(!decision.allowed);
}

#[tokio::test]
async fn unlimited_tier_is_always_granted_and_still_counted() {
    let harness = TestHarness::new(test_catalog());
    harness.enforcer.change_tier("u1", Tier::Premium).await.unwrap();

    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 1_000_000)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.limit, Limit::Unlimited);
    assert_eq!(decision.remaining, None);

    let record = harness.store.get("u1", start_time()).await.unwrap();
    assert_eq!(record.characters_used_this_month, 1_000_000);
}

#[tokio::test]
async fn zero_amount_returns_snapshot_without_mutation() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 10_000);

    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 0)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.current, 10_000);
    assert_eq!(decision.remaining, Some(0));

    let record = harness.store.get("u1", start_time()).await.unwrap();
    assert_eq!(record.characters_used_this_month, 10_000);
    assert_eq!(record.updated_utc, start_time());
}

#[tokio::test]
async fn negative_amount_is_rejected() {
    let harness = TestHarness::new(test_catalog());
    let err = harness
        .enforcer
        .authorize("u1", Resource::Characters, -5)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::InvalidArgument(_)));
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn unknown_user_starts_on_free_tier() {
    let harness = TestHarness::new(test_catalog());
    let stats = harness.enforcer.stats("new-user").await.unwrap();
    assert_eq!(stats.tier, Tier::Free);
    assert_eq!(stats.current.characters, 0);
    assert_eq!(stats.remaining.characters, Some(10_000));
}

// =============================================================================
// Requests per minute
// =============================================================================

#[tokio::test]
async fn sixth_request_in_a_minute_is_denied_until_window_rolls() {
    let harness = TestHarness::new(test_catalog());

    for i in 1..=5 {
        let decision = harness
            .enforcer
            .authorize("u1", Resource::Requests, 1)
            .await
            .unwrap();
        assert!(decision.allowed, "request {} should be allowed", i);
        harness.clock.advance(Duration::seconds(1));
    }

    let denied = harness
        .enforcer
        .authorize("u1", Resource::Requests, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.current, 5);
    assert_eq!(denied.resets_at, Some(start_time() + Duration::seconds(60)));

    let rejection = denied.rejection(harness.clock.now()).unwrap();
    assert!(rejection.to_string().contains("5 requests per minute"));

    harness.clock.advance(Duration::seconds(61));
    let decision = harness
        .enforcer
        .authorize("u1", Resource::Requests, 1)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.current, 1);
}

// =============================================================================
// Voice clones
// =============================================================================

#[tokio::test]
async fn voice_clones_never_reset_with_time() {
    let harness = TestHarness::new(test_catalog());

    let first = harness
        .enforcer
        .authorize_named("u1", "voiceClones", 1)
        .await
        .unwrap();
    assert!(first.allowed);
    assert_eq!(first.resets_at, None);

    harness.clock.advance(Duration::days(45));
    let second = harness
        .enforcer
        .authorize_named("u1", "voice_clones", 1)
        .await
        .unwrap();
    assert!(!second.allowed);
    assert_eq!(second.current, 1);
}

#[tokio::test]
async fn zero_cap_denies_any_positive_amount() {
    let harness = TestHarness::new(TierCatalog::default());
    let decision = harness
        .enforcer
        .authorize("u1", Resource::VoiceClones, 1)
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.limit, Limit::Capped(0));
}

// =============================================================================
// Windows and resets
// =============================================================================

#[tokio::test]
async fn month_rollover_resets_characters_lazily() {
    let start = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 0).unwrap();
    let harness = TestHarness::starting_at(test_catalog(), start);
    let mut record = UsageRecord::new("u1", start, start);
    record.characters_used_this_month = 10_000;
    harness.store.insert(record);

    let denied = harness
        .enforcer
        .authorize("u1", Resource::Characters, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(
        denied.resets_at,
        Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap())
    );

    harness.clock.advance(Duration::minutes(2));
    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 100)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.current, 100);
}

#[tokio::test]
async fn explicit_resets_are_idempotent() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 4_000);
    harness
        .enforcer
        .authorize("u1", Resource::Requests, 3)
        .await
        .unwrap();

    let first = harness.enforcer.reset_month_window("u1").await.unwrap();
    let second = harness.enforcer.reset_month_window("u1").await.unwrap();
    assert_eq!(first.characters_used_this_month, 0);
    assert_eq!(first.last_character_reset_at, second.last_character_reset_at);

    let first = harness.enforcer.reset_minute_window("u1").await.unwrap();
    let second = harness.enforcer.reset_minute_window("u1").await.unwrap();
    assert_eq!(first.requests_this_minute, second.requests_this_minute);
    assert_eq!(second.requests_this_minute.count, 0);
}

#[tokio::test]
async fn tier_change_applies_new_limits_and_resets_month() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 10_000);

    let record = harness.enforcer.change_tier("u1", Tier::Pro).await.unwrap();
    assert_eq!(record.tier, Tier::Pro);
    assert_eq!(record.characters_used_this_month, 0);

    let decision = harness
        .enforcer
        .authorize("u1", Resource::Characters, 50_000)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.limit, Limit::Capped(100_000));
}

#[tokio::test]
async fn downgrade_below_current_usage_denies_without_mutation() {
    let harness = TestHarness::new(test_catalog());
    harness.enforcer.change_tier("u1", Tier::Pro).await.unwrap();
    let granted = harness
        .enforcer
        .authorize("u1", Resource::VoiceClones, 3)
        .await
        .unwrap();
    assert!(granted.allowed);

    harness.enforcer.change_tier("u1", Tier::Free).await.unwrap();
    let denied = harness
        .enforcer
        .authorize("u1", Resource::VoiceClones, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.current, 3);
    assert_eq!(denied.limit, Limit::Capped(1));
    assert_eq!(denied.remaining, Some(0));

    let record = harness.store.get("u1", harness.clock.now()).await.unwrap();
    assert_eq!(record.voice_clones_used, 3);

    let events = harness.enforcer.usage_events("u1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource, Resource::VoiceClones);
    assert_eq!(events[0].event_type, UsageEventType::Error);
    assert_eq!(events[0].percentage, 300.0);

    let stats = harness.enforcer.stats("u1").await.unwrap();
    assert_eq!(stats.remaining.voice_clones, Some(0));
}

// =============================================================================
// Refunds
// =============================================================================

#[tokio::test]
async fn refund_restores_the_counter() {
    let harness = TestHarness::new(test_catalog());
    harness
        .enforcer
        .authorize("u1", Resource::Characters, 700)
        .await
        .unwrap();

    let record = harness
        .enforcer
        .refund("u1", Resource::Characters, 700)
        .await
        .unwrap();
    assert_eq!(record.characters_used_this_month, 0);
}

#[tokio::test]
async fn refund_after_rollover_never_goes_negative() {
    let harness = TestHarness::new(test_catalog());
    harness
        .enforcer
        .authorize("u1", Resource::Requests, 2)
        .await
        .unwrap();
    harness.clock.advance(Duration::minutes(3));
    harness.enforcer.stats("u1").await.unwrap();

    let record = harness
        .enforcer
        .refund("u1", Resource::Requests, 2)
        .await
        .unwrap();
    assert_eq!(record.requests_this_minute.count, 0);
}

#[tokio::test]
async fn refund_retries_through_transient_failures() {
    let harness = TestHarness::new(test_catalog());
    harness
        .enforcer
        .authorize("u1", Resource::Characters, 300)
        .await
        .unwrap();

    harness.store.fail_next(2);
    let record = harness
        .enforcer
        .refund("u1", Resource::Characters, 100)
        .await
        .unwrap();
    assert_eq!(record.characters_used_this_month, 200);
}

#[tokio::test]
async fn refund_gives_up_when_store_stays_down() {
    let harness = TestHarness::new(test_catalog());
    harness.store.set_available(false);

    let err = harness
        .enforcer
        .refund("u1", Resource::Characters, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::StorageUnavailable(_)));
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn storage_outage_fails_closed() {
    let harness = TestHarness::new(test_catalog());
    harness.store.set_available(false);

    for resource in Resource::ALL {
        let err = harness
            .enforcer
            .authorize("u1", resource, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::StorageUnavailable(_)));
    }

    harness.store.set_available(true);
    let record = harness.store.get("u1", start_time()).await.unwrap();
    assert_eq!(record.characters_used_this_month, 0);
    assert_eq!(record.requests_this_minute.count, 0);
}

// =============================================================================
// Stats and events
// =============================================================================

#[tokio::test]
async fn stats_report_limits_usage_and_remaining() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 2_500);
    harness
        .enforcer
        .authorize("u1", Resource::Requests, 1)
        .await
        .unwrap();

    let stats = harness.enforcer.stats("u1").await.unwrap();
    assert_eq!(stats.limits.characters_per_month, Limit::Capped(10_000));
    assert_eq!(stats.current.characters, 2_500);
    assert_eq!(stats.current.requests, 1);
    assert_eq!(stats.remaining.characters, Some(7_500));
    assert_eq!(stats.remaining.requests, Some(4));
    assert_eq!(stats.remaining.voice_clones, Some(1));
}

#[tokio::test]
async fn stats_include_daily_history_newest_first() {
    let harness = TestHarness::new(test_catalog());
    harness
        .enforcer
        .authorize("u1", Resource::Characters, 1_000)
        .await
        .unwrap();

    harness.clock.advance(Duration::days(1));
    harness
        .enforcer
        .authorize("u1", Resource::Characters, 500)
        .await
        .unwrap();
    harness
        .enforcer
        .authorize("u1", Resource::Requests, 1)
        .await
        .unwrap();
    let denied = harness
        .enforcer
        .authorize("u1", Resource::Characters, 50_000)
        .await
        .unwrap();
    assert!(!denied.allowed);
    harness
        .enforcer
        .refund("u1", Resource::Characters, 200)
        .await
        .unwrap();

    let stats = harness.enforcer.stats("u1").await.unwrap();
    assert_eq!(stats.history.len(), 2);
    assert_eq!(stats.history[0].date, "2025-03-15");
    assert_eq!(stats.history[0].characters, 300);
    assert_eq!(stats.history[0].requests, 1);
    assert_eq!(stats.history[1].date, "2025-03-14");
    assert_eq!(stats.history[1].characters, 1_000);
    assert_eq!(stats.history[1].requests, 0);
}

#[tokio::test]
async fn history_keeps_the_last_thirty_days() {
    let harness = TestHarness::new(test_catalog());
    for day in 0..35 {
        if day > 0 {
            harness.clock.advance(Duration::days(1));
        }
        harness
            .enforcer
            .authorize("u1", Resource::Requests, 1)
            .await
            .unwrap();
    }

    let stats = harness.enforcer.stats("u1").await.unwrap();
    assert_eq!(stats.history.len(), 30);
    assert!(stats.history.iter().all(|day| day.requests == 1));
    assert_eq!(stats.history[0].date, "2025-04-17");

    let record = harness.store.get("u1", harness.clock.now()).await.unwrap();
    assert_eq!(record.history.len(), 30);
}

#[tokio::test]
async fn usage_events_follow_thresholds() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 8_000);

    let events = harness.enforcer.usage_events("u1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, UsageEventType::Warning);
    assert_eq!(events[0].resource, Resource::Characters);
    assert_eq!(events[0].percentage, 80.0);

    harness
        .enforcer
        .authorize("u1", Resource::Characters, 1_500)
        .await
        .unwrap();
    let events = harness.enforcer.usage_events("u1").await.unwrap();
    assert_eq!(events[0].event_type, UsageEventType::Error);
    assert!(events[0].persistent);
}

#[tokio::test]
async fn deleted_user_starts_over() {
    let harness = TestHarness::new(test_catalog());
    seed_characters(&harness, "u1", 5_000);

    assert!(harness.enforcer.delete_user("u1").await.unwrap());
    assert!(!harness.enforcer.delete_user("u1").await.unwrap());
    let stats = harness.enforcer.stats("u1").await.unwrap();
    assert_eq!(stats.current.characters, 0);
}
