//! Time source for window arithmetic.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock};

/// Wall-clock abstraction so window rollover can be driven by tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(start)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut t = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *t += delta;
    }

    pub fn set(&self, value: DateTime<Utc>) {
        let mut t = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *t = value;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}
