//! Quota enforcement: the only component that mutates usage counters.

use crate::models::{QuotaDecision, Resource, Tier, UsageEvent, UsageRecord, UsageStats};
use crate::services::catalog::TierCatalog;
use crate::services::clock::{Clock, SystemClock};
use crate::services::metrics::{
    record_quota_decision, record_refund, record_store_error, record_units_consumed,
    record_window_reset,
};
use crate::services::notifier;
use crate::services::scheduler::{
    minute_bucket_start, next_month_start, roll_expired_windows, MINUTE_WINDOW_SECS,
};
use crate::services::store::{IncrementOutcome, StoreError, UsageStore};
use backoff::future::retry;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<StoreError> for QuotaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => QuotaError::StorageUnavailable(msg),
        }
    }
}

impl From<QuotaError> for AppError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::InvalidArgument(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            QuotaError::StorageUnavailable(msg) => AppError::ServiceUnavailable(msg),
        }
    }
}

/// Backoff budget for compensating decrements.
#[derive(Debug, Clone, Copy)]
pub struct RefundPolicy {
    pub initial_interval: std::time::Duration,
    pub max_interval: std::time::Duration,
    pub max_elapsed: std::time::Duration,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            initial_interval: std::time::Duration::from_millis(100),
            max_interval: std::time::Duration::from_secs(2),
            max_elapsed: std::time::Duration::from_secs(10),
        }
    }
}

impl RefundPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

/// Authorizes metered operations against tier limits.
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn UsageStore>,
    catalog: Arc<TierCatalog>,
    clock: Arc<dyn Clock>,
    refund_policy: RefundPolicy,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn UsageStore>, catalog: TierCatalog) -> Self {
        Self {
            store,
            catalog: Arc::new(catalog),
            clock: Arc::new(SystemClock),
            refund_policy: RefundPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_refund_policy(mut self, policy: RefundPolicy) -> Self {
        self.refund_policy = policy;
        self
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// Check `requested` units of `resource` against the user's tier and
    /// consume them if they fit.
    ///
    /// Denial is a normal `Ok` result with `allowed == false` and never
    /// mutates. Storage failures are errors, so callers fail closed.
    #[instrument(skip(self), fields(user_id = %user_id, resource = %resource))]
    pub async fn authorize(
        &self,
        user_id: &str,
        resource: Resource,
        requested: i64,
    ) -> Result<QuotaDecision, QuotaError> {
        validate_user_id(user_id)?;
        let amount = validate_amount(requested)?;
        let now = self.clock.now();

        let record = self.current_record(user_id, now).await.inspect_err(|_| {
            record_quota_decision(resource.as_str(), "error");
        })?;
        let limits = self.catalog.limits_for(record.tier);
        let limit = resource.limit_in(&limits);
        let resets_at = resets_at(resource, &record, now);

        if amount == 0 {
            record_quota_decision(resource.as_str(), "allowed");
            return Ok(QuotaDecision::new(
                true,
                resource,
                record.used(resource),
                limit,
                resets_at,
            ));
        }

        let outcome = self
            .store
            .try_increment(user_id, resource, amount, limit.ceiling(), now)
            .await
            .map_err(|e| {
                record_quota_decision(resource.as_str(), "error");
                storage_failure("try_increment", user_id, e)
            })?;

        let decision = match outcome {
            IncrementOutcome::Applied(updated) => {
                record_quota_decision(resource.as_str(), "allowed");
                record_units_consumed(resource.as_str(), amount);
                tracing::debug!(
                    amount,
                    current = updated.used(resource),
                    limit = %limit,
                    "Quota granted"
                );
                QuotaDecision::new(true, resource, updated.used(resource), limit, resets_at)
            }
            IncrementOutcome::Rejected(unchanged) => {
                record_quota_decision(resource.as_str(), "denied");
                tracing::info!(
                    amount,
                    current = unchanged.used(resource),
                    limit = %limit,
                    tier = %unchanged.tier,
                    "Quota exceeded"
                );
                QuotaDecision::new(false, resource, unchanged.used(resource), limit, resets_at)
            }
        };

        Ok(decision)
    }

    /// [`authorize`](Self::authorize) with the resource given by name.
    pub async fn authorize_named(
        &self,
        user_id: &str,
        resource: &str,
        requested: i64,
    ) -> Result<QuotaDecision, QuotaError> {
        let resource: Resource = resource
            .parse()
            .map_err(|e: crate::models::UnknownResource| QuotaError::InvalidArgument(e.to_string()))?;
        self.authorize(user_id, resource, requested).await
    }

    /// Give back units reserved by an operation that did not complete.
    ///
    /// Retried with bounded backoff. A refund that keeps failing is left as a
    /// stale reservation and reported to the caller.
    #[instrument(skip(self), fields(user_id = %user_id, resource = %resource))]
    pub async fn refund(
        &self,
        user_id: &str,
        resource: Resource,
        amount: i64,
    ) -> Result<UsageRecord, QuotaError> {
        validate_user_id(user_id)?;
        let amount = validate_amount(amount)?;

        if amount == 0 {
            return self
                .store
                .get(user_id, self.clock.now())
                .await
                .map_err(|e| storage_failure("get", user_id, e));
        }

        let result = retry(self.refund_policy.backoff(), move || async move {
            self.store
                .decrement(user_id, resource, amount, self.clock.now())
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, amount, "Refund attempt failed, will retry");
                    record_store_error("decrement");
                    backoff::Error::transient(e)
                })
        })
        .await;

        match result {
            Ok(record) => {
                record_refund(resource.as_str(), "applied");
                tracing::info!(amount, current = record.used(resource), "Usage refunded");
                Ok(record)
            }
            Err(e) => {
                record_refund(resource.as_str(), "failed");
                tracing::error!(
                    error = %e,
                    amount,
                    "Refund abandoned after retries; reservation left in place"
                );
                Err(e.into())
            }
        }
    }

    /// Billing hook: apply a new tier and start a fresh monthly window.
    #[instrument(skip(self), fields(user_id = %user_id, tier = %tier))]
    pub async fn change_tier(&self, user_id: &str, tier: Tier) -> Result<UsageRecord, QuotaError> {
        validate_user_id(user_id)?;
        let record = self
            .store
            .change_tier(user_id, tier, self.clock.now())
            .await
            .map_err(|e| storage_failure("change_tier", user_id, e))?;
        record_window_reset("month", "tier_change");
        tracing::info!("Subscription tier applied");
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn reset_minute_window(&self, user_id: &str) -> Result<UsageRecord, QuotaError> {
        validate_user_id(user_id)?;
        let now = self.clock.now();
        let record = self
            .store
            .reset_minute_window(user_id, minute_bucket_start(now), now)
            .await
            .map_err(|e| storage_failure("reset_minute_window", user_id, e))?;
        record_window_reset("minute", "explicit");
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn reset_month_window(&self, user_id: &str) -> Result<UsageRecord, QuotaError> {
        validate_user_id(user_id)?;
        let record = self
            .store
            .reset_month_window(user_id, self.clock.now())
            .await
            .map_err(|e| storage_failure("reset_month_window", user_id, e))?;
        record_window_reset("month", "explicit");
        Ok(record)
    }

    /// Usage, limits and remaining allowance with expired windows rolled over.
    pub async fn stats(&self, user_id: &str) -> Result<UsageStats, QuotaError> {
        validate_user_id(user_id)?;
        let now = self.clock.now();
        let record = self.current_record(user_id, now).await?;
        let limits = self.catalog.limits_for(record.tier);
        Ok(UsageStats::from_record(&record, limits, now))
    }

    /// Threshold events for the user's current usage.
    pub async fn usage_events(&self, user_id: &str) -> Result<Vec<UsageEvent>, QuotaError> {
        validate_user_id(user_id)?;
        let record = self.current_record(user_id, self.clock.now()).await?;
        let limits = self.catalog.limits_for(record.tier);
        Ok(notifier::evaluate(&record, &limits))
    }

    /// Drop the user's counters after account deletion.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn delete_user(&self, user_id: &str) -> Result<bool, QuotaError> {
        validate_user_id(user_id)?;
        self.store
            .remove(user_id)
            .await
            .map_err(|e| storage_failure("remove", user_id, e))
    }

    async fn current_record(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, QuotaError> {
        roll_expired_windows(self.store.as_ref(), user_id, now)
            .await
            .map_err(|e| storage_failure("roll_expired_windows", user_id, e))
    }
}

fn resets_at(resource: Resource, record: &UsageRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match resource {
        Resource::Requests => Some(
            record.requests_this_minute.window_start + Duration::seconds(MINUTE_WINDOW_SECS),
        ),
        Resource::Characters => Some(next_month_start(now)),
        Resource::VoiceClones => None,
    }
}

fn validate_user_id(user_id: &str) -> Result<(), QuotaError> {
    if user_id.trim().is_empty() {
        return Err(QuotaError::InvalidArgument(
            "user_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> Result<u64, QuotaError> {
    u64::try_from(amount).map_err(|_| {
        QuotaError::InvalidArgument(format!("amount must not be negative, got {}", amount))
    })
}

fn storage_failure(operation: &'static str, user_id: &str, err: StoreError) -> QuotaError {
    tracing::error!(operation, user_id = %user_id, error = %err, "Usage store operation failed");
    record_store_error(operation);
    err.into()
}
