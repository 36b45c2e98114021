//! Exponential backoff for contended resources and catalog retries.

use std::time::Duration;

use tapegrid_core::ErrorKind;
use tapegrid_state::StateResult;
use tracing::warn;

use crate::error::LrsResult;

/// Doubling delay, capped at `max`, back to `base` on reset.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max: max.max(base),
        }
    }

    /// Delay to wait now; doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Run a catalog operation, retrying unavailability up to `budget` times.
/// Lookup errors (not found, already exists) are returned immediately.
pub async fn retry_catalog<T, F>(what: &str, budget: u32, base: Duration, mut op: F) -> LrsResult<T>
where
    F: FnMut() -> StateResult<T>,
{
    let mut backoff = Backoff::new(base, base * 8);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == ErrorKind::CatalogUnavailable && attempt < budget => {
                attempt += 1;
                let delay = backoff.next_delay();
                warn!(%what, attempt, ?delay, error = %e, "catalog unavailable, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
