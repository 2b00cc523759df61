pub mod catalog;
pub mod clock;
pub mod database;
pub mod enforcer;
pub mod metrics;
pub mod notifier;
pub mod scheduler;
pub mod store;

pub use catalog::{CatalogError, TierCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::MongoUsageStore;
pub use enforcer::{QuotaEnforcer, QuotaError, RefundPolicy};
pub use metrics::{get_metrics, init_metrics};
pub use scheduler::ResetSweeper;
pub use store::{IncrementOutcome, InMemoryUsageStore, StoreError, StoreResult, UsageStore};
