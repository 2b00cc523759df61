#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use usage_service::models::{Limit, Tier, TierDefinition};
use usage_service::services::{
    InMemoryUsageStore, ManualClock, QuotaEnforcer, RefundPolicy, TierCatalog,
};

pub struct TestHarness {
    pub store: Arc<InMemoryUsageStore>,
    pub clock: ManualClock,
    pub enforcer: QuotaEnforcer,
}

impl TestHarness {
    pub fn new(catalog: TierCatalog) -> Self {
        Self::starting_at(catalog, start_time())
    }

    pub fn starting_at(catalog: TierCatalog, start: DateTime<Utc>) -> Self {
        let store = Arc::new(InMemoryUsageStore::new());
        let clock = ManualClock::new(start);
        let enforcer = QuotaEnforcer::new(store.clone(), catalog)
            .with_clock(Arc::new(clock.clone()))
            .with_refund_policy(fast_refunds());

        TestHarness {
            store,
            clock,
            enforcer,
        }
    }
}

/// Mid-month and aligned to a minute boundary.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap()
}

pub fn fast_refunds() -> RefundPolicy {
    RefundPolicy {
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        max_elapsed: Duration::from_millis(500),
    }
}

pub fn tier(tier_id: Tier, rpm: u64, characters: Limit, clones: Limit) -> TierDefinition {
    TierDefinition {
        tier_id,
        requests_per_minute: rpm,
        characters_per_month: characters,
        voice_clones: clones,
    }
}

/// free: 5 rpm, 10 000 chars, 1 clone. premium: unlimited characters and clones.
pub fn test_catalog() -> TierCatalog {
    TierCatalog::new([
        tier(Tier::Free, 5, Limit::Capped(10_000), Limit::Capped(1)),
        tier(Tier::Pro, 10, Limit::Capped(100_000), Limit::Capped(3)),
        tier(Tier::Premium, 30, Limit::Unlimited, Limit::Unlimited),
    ])
}
