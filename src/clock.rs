use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of time for the sync engine. Rate limiting, backoff and token
/// expiry all go through this so tests can run on virtual time.
#[allow(async_fn_in_trait)]
pub trait Clock: Clone {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `chrono::Utc` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
