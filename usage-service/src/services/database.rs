use crate::models::{history_key, Resource, Tier, UsageRecord};
use crate::services::scheduler::minute_bucket_start;
use crate::services::store::{IncrementOutcome, StoreError, StoreResult, UsageStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, DateTime as BsonDateTime, Document},
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB-backed [`UsageStore`]. One document per user in `usage_records`.
///
/// Conditional writes carry their precondition in the filter, so the check
/// and the mutation happen in a single server-side update.
#[derive(Clone)]
pub struct MongoUsageStore {
    client: MongoClient,
    db: Database,
}

impl MongoUsageStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for usage-service");

        let records = self.records();

        let user_id_index = IndexModel::builder()
            .keys(doc! { "user_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("user_id_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        records.create_index(user_id_index, None).await.map_err(|e| {
            tracing::error!("Failed to create user_id index: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;

        // Idle sweeps scan by last update
        let updated_index = IndexModel::builder()
            .keys(doc! { "updated_utc": 1 })
            .options(
                IndexOptions::builder()
                    .name("updated_utc_idx".to_string())
                    .build(),
            )
            .build();

        records.create_index(updated_index, None).await.map_err(|e| {
            tracing::error!("Failed to create updated_utc index: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    pub fn records(&self) -> Collection<UsageRecord> {
        self.db.collection("usage_records")
    }

    /// Return the user's record, inserting a zeroed one first if needed.
    async fn ensure_record(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<UsageRecord> {
        let mut initial = mongodb::bson::to_document(&UsageRecord::new(
            user_id,
            minute_bucket_start(now),
            now,
        ))
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        initial.remove("user_id");

        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let result = self
            .records()
            .find_one_and_update(
                doc! { "user_id": user_id },
                doc! { "$setOnInsert": initial },
                options,
            )
            .await;

        match result {
            Ok(Some(record)) => Ok(record),
            Ok(None) => self.find_existing(user_id).await,
            // A concurrent upsert inserted the record first
            Err(e) if is_duplicate_key(&e) => self.find_existing(user_id).await,
            Err(e) => Err(unavailable("ensure_record", e)),
        }
    }

    async fn find_existing(&self, user_id: &str) -> StoreResult<UsageRecord> {
        self.records()
            .find_one(doc! { "user_id": user_id }, None)
            .await
            .map_err(|e| unavailable("find_one", e))?
            .ok_or_else(|| StoreError::Unavailable(format!("usage record for {} vanished", user_id)))
    }

    /// Apply `update` to an existing record and return the result.
    async fn update_record(
        &self,
        operation: &'static str,
        user_id: &str,
        update: Vec<Document>,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        self.ensure_record(user_id, now).await?;
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        match self
            .records()
            .find_one_and_update(doc! { "user_id": user_id }, update, options)
            .await
            .map_err(|e| unavailable(operation, e))?
        {
            Some(record) => Ok(record),
            None => self.ensure_record(user_id, now).await,
        }
    }

    /// Drop history days that fell out of the retained window.
    async fn prune_history(&self, record: &UsageRecord, now: DateTime<Utc>) {
        let stale = record.stale_history_keys(now);
        if stale.is_empty() {
            return;
        }
        let mut unset = Document::new();
        for key in &stale {
            unset.insert(format!("history.{}", key), "");
        }
        if let Err(e) = self
            .records()
            .update_one(doc! { "user_id": record.user_id.as_str() }, doc! { "$unset": unset }, None)
            .await
        {
            tracing::warn!(user_id = %record.user_id, error = %e, "Failed to prune usage history");
        }
    }
}

fn history_path(resource: Resource, now: DateTime<Utc>) -> String {
    format!("history.{}.{}", history_key(now), resource.history_field())
}

#[async_trait]
impl UsageStore for MongoUsageStore {
    async fn get(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<UsageRecord> {
        self.ensure_record(user_id, now).await
    }

    #[tracing::instrument(skip(self, now))]
    async fn try_increment(
        &self,
        user_id: &str,
        resource: Resource,
        amount: u64,
        ceiling: Option<u64>,
        now: DateTime<Utc>,
    ) -> StoreResult<IncrementOutcome> {
        let existing = self.ensure_record(user_id, now).await?;
        let field = resource.counter_field();

        let mut filter = doc! { "user_id": user_id };
        if let Some(max) = ceiling {
            match max.checked_sub(amount) {
                Some(headroom) => {
                    filter.insert(field, doc! { "$lte": to_i64(headroom) });
                }
                None => return Ok(IncrementOutcome::Rejected(existing)),
            }
        }

        let day = history_path(resource, now);
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = self
            .records()
            .find_one_and_update(
                filter,
                doc! {
                    "$inc": {
                        field: to_i64(amount),
                        day: to_i64(amount),
                    },
                    "$set": { "updated_utc": BsonDateTime::from_chrono(now) },
                },
                options,
            )
            .await
            .map_err(|e| unavailable("try_increment", e))?;

        match updated {
            Some(record) => {
                self.prune_history(&record, now).await;
                Ok(IncrementOutcome::Applied(record))
            }
            None => Ok(IncrementOutcome::Rejected(self.find_existing(user_id).await?)),
        }
    }

    #[tracing::instrument(skip(self, now))]
    async fn decrement(
        &self,
        user_id: &str,
        resource: Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        let field = resource.counter_field();
        let current = format!("${}", field);
        let day = history_path(resource, now);
        let day_total = format!("${}", day);
        let update = vec![doc! {
            "$set": {
                field: { "$max": [0_i64, { "$subtract": [current, to_i64(amount)] }] },
                day: {
                    "$max": [0_i64, { "$subtract": [{ "$ifNull": [day_total, 0_i64] }, to_i64(amount)] }]
                },
                "updated_utc": BsonDateTime::from_chrono(now),
            }
        }];
        self.update_record("decrement", user_id, update, now).await
    }

    async fn reset_minute_window(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        let update = vec![doc! {
            "$set": {
                "requests_this_minute.count": 0_i64,
                "requests_this_minute.window_start": {
                    "$max": ["$requests_this_minute.window_start", BsonDateTime::from_chrono(window_start)]
                },
                "updated_utc": BsonDateTime::from_chrono(now),
            }
        }];
        self.update_record("reset_minute_window", user_id, update, now)
            .await
    }

    async fn reset_month_window(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        let update = vec![doc! {
            "$set": {
                "characters_used_this_month": 0_i64,
                "last_character_reset_at": {
                    "$max": ["$last_character_reset_at", BsonDateTime::from_chrono(now)]
                },
                "updated_utc": BsonDateTime::from_chrono(now),
            }
        }];
        self.update_record("reset_month_window", user_id, update, now)
            .await
    }

    async fn roll_minute_window(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = self
            .records()
            .update_one(
                doc! {
                    "user_id": user_id,
                    "requests_this_minute.window_start": { "$lt": BsonDateTime::from_chrono(window_start) },
                },
                doc! {
                    "$set": {
                        "requests_this_minute.count": 0_i64,
                        "requests_this_minute.window_start": BsonDateTime::from_chrono(window_start),
                        "updated_utc": BsonDateTime::from_chrono(now),
                    }
                },
                None,
            )
            .await
            .map_err(|e| unavailable("roll_minute_window", e))?;
        Ok(result.modified_count > 0)
    }

    async fn roll_month_window(
        &self,
        user_id: &str,
        month_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = self
            .records()
            .update_one(
                doc! {
                    "user_id": user_id,
                    "last_character_reset_at": { "$lt": BsonDateTime::from_chrono(month_start) },
                },
                doc! {
                    "$set": {
                        "characters_used_this_month": 0_i64,
                        "last_character_reset_at": BsonDateTime::from_chrono(now),
                        "updated_utc": BsonDateTime::from_chrono(now),
                    }
                },
                None,
            )
            .await
            .map_err(|e| unavailable("roll_month_window", e))?;
        Ok(result.modified_count > 0)
    }

    #[tracing::instrument(skip(self, now))]
    async fn change_tier(
        &self,
        user_id: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRecord> {
        let update = vec![doc! {
            "$set": {
                "tier": tier.as_str(),
                "characters_used_this_month": 0_i64,
                "last_character_reset_at": {
                    "$max": ["$last_character_reset_at", BsonDateTime::from_chrono(now)]
                },
                "updated_utc": BsonDateTime::from_chrono(now),
            }
        }];
        self.update_record("change_tier", user_id, update, now).await
    }

    async fn remove_idle(
        &self,
        idle_since: DateTime<Utc>,
        month_start: DateTime<Utc>,
    ) -> StoreResult<usize> {
        // Mirrors UsageRecord::is_reclaimable
        let filter = doc! {
            "updated_utc": { "$lt": BsonDateTime::from_chrono(idle_since) },
            "tier": Tier::Free.as_str(),
            "voice_clones_used": 0_i64,
            "$or": [
                { "characters_used_this_month": 0_i64 },
                { "last_character_reset_at": { "$lt": BsonDateTime::from_chrono(month_start) } },
            ],
        };
        let result = self
            .records()
            .delete_many(filter, None)
            .await
            .map_err(|e| unavailable("remove_idle", e))?;
        Ok(usize::try_from(result.deleted_count).unwrap_or(usize::MAX))
    }

    async fn remove(&self, user_id: &str) -> StoreResult<bool> {
        let result = self
            .records()
            .delete_one(doc! { "user_id": user_id }, None)
            .await
            .map_err(|e| unavailable("remove", e))?;
        Ok(result.deleted_count > 0)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| unavailable("ping", e))?;
        Ok(())
    }
}

fn unavailable(operation: &str, err: mongodb::error::Error) -> StoreError {
    tracing::error!(operation, "MongoDB operation failed: {}", err);
    StoreError::Unavailable(err.to_string())
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Counters are stored as BSON int64.
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
