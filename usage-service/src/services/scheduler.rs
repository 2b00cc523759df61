//! Window rollover.
//!
//! Rollover is lazy: the enforcer calls [`roll_expired_windows`] before every
//! decision, so correctness never depends on a timer. [`ResetSweeper`] is an
//! optional background task that only reclaims records of inactive users.

use crate::models::UsageRecord;
use crate::services::metrics::{record_store_error, record_sweep, record_window_reset};
use crate::services::store::{StoreResult, UsageStore};
use crate::services::Clock;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const MINUTE_WINDOW_SECS: i64 = 60;

/// Start of the fixed one-minute bucket containing `now` (epoch-aligned).
pub fn minute_bucket_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp().div_euclid(MINUTE_WINDOW_SECS) * MINUTE_WINDOW_SECS;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(now)
}

/// First instant of the calendar month containing `now`.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Start of the month after the one containing `now`.
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

pub fn minute_window_expired(window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - window_start >= Duration::seconds(MINUTE_WINDOW_SECS)
}

/// A month window expires once `now` is in a later calendar month than the
/// last reset. A reset stamped in the future never expires early.
pub fn month_window_expired(last_reset: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    last_reset < month_start(now)
}

/// Roll over any expired window for `user_id` and return the current record.
///
/// Each rollover is a conditional store update, so concurrent callers reset a
/// window at most once and never erase an increment made in the new window.
pub async fn roll_expired_windows(
    store: &dyn UsageStore,
    user_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<UsageRecord> {
    let record = store.get(user_id, now).await?;
    let mut rolled = false;

    if minute_window_expired(record.requests_this_minute.window_start, now)
        && store
            .roll_minute_window(user_id, minute_bucket_start(now), now)
            .await?
    {
        tracing::debug!(user_id = %user_id, "Request window rolled over");
        record_window_reset("minute", "lazy");
        rolled = true;
    }

    if month_window_expired(record.last_character_reset_at, now)
        && store
            .roll_month_window(user_id, month_start(now), now)
            .await?
    {
        tracing::info!(user_id = %user_id, "Monthly character window rolled over");
        record_window_reset("month", "lazy");
        rolled = true;
    }

    if rolled {
        store.get(user_id, now).await
    } else {
        Ok(record)
    }
}

/// Background task that deletes records idle for longer than `idle_retention`
/// when they hold nothing a fresh record would not: free tier, no voice clones
/// and no characters counted in the current month.
pub struct ResetSweeper {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    interval: std::time::Duration,
    idle_retention: Duration,
    shutdown_token: CancellationToken,
}

impl ResetSweeper {
    pub fn new(
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        interval: std::time::Duration,
        idle_retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            idle_retention,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token that stops the loop started by [`ResetSweeper::start`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run one sweep. Returns the number of records removed.
    pub async fn sweep_once(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let removed = self
            .store
            .remove_idle(now - self.idle_retention, month_start(now))
            .await?;
        record_sweep(removed);
        Ok(removed)
    }

    /// Spawn the sweep loop on the current runtime.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.shutdown_token.clone();

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            idle_retention_days = self.idle_retention.num_days(),
            "Starting usage record sweeper"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Usage record sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(0) => tracing::debug!("Sweep found no idle usage records"),
                            Ok(removed) => tracing::info!(removed, "Removed idle usage records"),
                            Err(e) => {
                                tracing::warn!(error = %e, "Usage record sweep failed");
                                record_store_error("remove_idle");
                            }
                        }
                    }
                }
            }
        })
    }
}
