use serde::Deserialize;
use service_core::config::{self as core_config, get_env, is_production};
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub store: StoreBackend,
    pub mongodb: MongoConfig,
    pub tier_catalog_path: Option<String>,
    pub sweep: SweepConfig,
    pub refund_max_elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

impl StoreBackend {
    fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "USAGE_STORE must be 'mongo' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub idle_retention_days: i64,
}

impl UsageConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = is_production();

        let store = StoreBackend::parse(&get_env("USAGE_STORE", Some("mongo"), is_prod)?)?;

        // The URI is only mandatory when the durable store is selected
        let mongodb = match store {
            StoreBackend::Mongo => MongoConfig {
                uri: get_env("MONGODB_URI", None, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("usage_db"), is_prod)?,
            },
            StoreBackend::Memory => MongoConfig {
                uri: env::var("MONGODB_URI").unwrap_or_default(),
                database: env::var("MONGODB_DATABASE").unwrap_or_else(|_| "usage_db".to_string()),
            },
        };

        Ok(UsageConfig {
            common: common_config,
            store,
            mongodb,
            tier_catalog_path: env::var("TIER_CATALOG_PATH").ok().filter(|p| !p.is_empty()),
            sweep: SweepConfig {
                enabled: env::var("SWEEP_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
                interval_secs: env::var("SWEEP_INTERVAL_SECS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
                idle_retention_days: idle_retention_days(
                    &env::var("IDLE_RETENTION_DAYS").unwrap_or_else(|_| "30".to_string()),
                ),
            },
            refund_max_elapsed_ms: env::var("REFUND_MAX_ELAPSED_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10_000),
        })
    }
}

/// Retention in days, at least one. Unparseable values fall back to 30.
fn idle_retention_days(raw: &str) -> i64 {
    raw.trim().parse::<i64>().unwrap_or(30).max(1)
}
