//! Usage counter store contract and the in-memory implementation.

use crate::models::{Limit, Resource, Tier, UsageRecord};
use crate::services::scheduler::minute_bucket_start;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a conditional increment.
#[derive(Debug, Clone, PartialEq)]
pub enum IncrementOutcome {
    /// The counter was incremented; holds the post-increment record.
    Applied(UsageRecord),
    /// The ceiling would have been exceeded; holds the unchanged record.
    Rejected(UsageRecord),
}

/// Durable per-user counters.
///
/// Every mutating call is a single atomic operation per `user_id`. Records are
/// created lazily, so no call fails for a missing user.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Current record, creating a zeroed one if none exists.
    async fn get(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<UsageRecord>;

    /// Add `amount` to the counter only if the result stays `<= ceiling`.
    /// A `None` ceiling always applies.
    async fn try_increment(
        &self,
        user_id: &str,
        resource: Resource,
        amount: u64,
        ceiling: Option<u64>,
        now: DateTime<Utc>,
    ) -> StoreResult<IncrementOutcome>;

    /// Unconditional increment.
    async fn increment(
        &self,
        user_id: &str,
        resource: Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        match self.try_increment(user_id, resource, amount, None, now).await? {
            IncrementOutcome::Applied(record) | IncrementOutcome::Rejected(record) => Ok(record),
        }
    }

    /// Subtract `amount`, saturating at zero.
    async fn decrement(
        &self,
        user_id: &str,
        resource: Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord>;

    /// Zero the request window. The window start never moves backwards.
    async fn reset_minute_window(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord>;

    /// Zero the monthly character counter. The reset timestamp never moves backwards.
    async fn reset_month_window(&self, user_id: &str, now: DateTime<Utc>)
        -> StoreResult<UsageRecord>;

    /// Zero the request window only if it started before `window_start`.
    /// Returns whether a rollover happened.
    async fn roll_minute_window(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Zero the character counter only if it was last reset before `month_start`.
    /// Returns whether a rollover happened.
    async fn roll_month_window(
        &self,
        user_id: &str,
        month_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Set the tier and reset the monthly window in one update.
    async fn change_tier(
        &self,
        user_id: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord>;

    /// Delete every record that [`UsageRecord::is_reclaimable`] for the given
    /// cutoffs, checking and deleting each one in a single operation.
    /// Returns the number removed.
    async fn remove_idle(
        &self,
        idle_since: DateTime<Utc>,
        month_start: DateTime<Utc>,
    ) -> StoreResult<usize>;

    /// Delete a record. Returns whether one existed.
    async fn remove(&self, user_id: &str) -> StoreResult<bool>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// In-process store for tests and local development.
///
/// Each operation runs under the map's per-key write lock, which gives the
/// same read-modify-write atomicity a conditional database update does.
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    records: DashMap<String, UsageRecord>,
    unavailable: AtomicBool,
    failures_pending: AtomicU32,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails while `false`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Seed or overwrite a record.
    pub fn insert(&self, record: UsageRecord) {
        self.records.insert(record.user_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        let pending = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(StoreError::Unavailable(
                "in-memory store injected failure".to_string(),
            ));
        }
        Ok(())
    }

    fn with_record<T>(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut UsageRecord) -> T,
    ) -> StoreResult<T> {
        self.check_available()?;
        let mut entry = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| UsageRecord::new(user_id, minute_bucket_start(now), now));
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<UsageRecord> {
        self.with_record(user_id, now, |record| record.clone())
    }

    async fn try_increment(
        &self,
        user_id: &str,
        resource: Resource,
        amount: u64,
        ceiling: Option<u64>,
        now: DateTime<Utc>,
    ) -> StoreResult<IncrementOutcome> {
        self.with_record(user_id, now, |record| {
            let current = record.used(resource);
            let limit = ceiling.map_or(Limit::Unlimited, Limit::Capped);
            if !limit.admits(current, amount) {
                return IncrementOutcome::Rejected(record.clone());
            }
            let counter = record.counter_mut(resource);
            *counter = counter.saturating_add(amount);
            record.record_daily(resource, amount, now);
            record.updated_utc = now;
            IncrementOutcome::Applied(record.clone())
        })
    }

    async fn decrement(
        &self,
        user_id: &str,
        resource: Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        self.with_record(user_id, now, |record| {
            let counter = record.counter_mut(resource);
            *counter = counter.saturating_sub(amount);
            record.refund_daily(resource, amount, now);
            record.updated_utc = now;
            record.clone()
        })
    }

    async fn reset_minute_window(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        self.with_record(user_id, now, |record| {
            record.requests_this_minute.count = 0;
            record.requests_this_minute.window_start =
                record.requests_this_minute.window_start.max(window_start);
            record.updated_utc = now;
            record.clone()
        })
    }

    async fn reset_month_window(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        self.with_record(user_id, now, |record| {
            record.characters_used_this_month = 0;
            record.last_character_reset_at = record.last_character_reset_at.max(now);
            record.updated_utc = now;
            record.clone()
        })
    }

    async fn roll_minute_window(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_record(user_id, now, |record| {
            if record.requests_this_minute.window_start >= window_start {
                return false;
            }
            record.requests_this_minute.count = 0;
            record.requests_this_minute.window_start = window_start;
            record.updated_utc = now;
            true
        })
    }

    async fn roll_month_window(
        &self,
        user_id: &str,
        month_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_record(user_id, now, |record| {
            if record.last_character_reset_at >= month_start {
                return false;
            }
            record.characters_used_this_month = 0;
            record.last_character_reset_at = now;
            record.updated_utc = now;
            true
        })
    }

    async fn change_tier(
        &self,
        user_id: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        self.with_record(user_id, now, |record| {
            record.tier = tier;
            record.characters_used_this_month = 0;
            record.last_character_reset_at = record.last_character_reset_at.max(now);
            record.updated_utc = now;
            record.clone()
        })
    }

    async fn remove_idle(
        &self,
        idle_since: DateTime<Utc>,
        month_start: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.check_available()?;
        let mut removed = 0;
        // retain holds each shard's write lock while deciding
        self.records.retain(|_, record| {
            let reclaim = record.is_reclaimable(idle_since, month_start);
            if reclaim {
                removed += 1;
            }
            !reclaim
        });
        Ok(removed)
    }

    async fn remove(&self, user_id: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.records.remove(user_id).is_some())
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.check_available()
    }
}
