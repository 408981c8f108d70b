//! Bounded exponential backoff used for readiness polling.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CsiError;

/// Polling schedule: wait `initial`, then multiply the delay by `factor`
/// after each attempt, for at most `steps` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "millis")]
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.2,
            steps: 10,
        }
    }
}

impl Backoff {
    /// Evaluate `condition` until it yields `true`, sleeping between
    /// attempts.  Errors from the condition abort polling immediately.
    ///
    /// Returns `Ok(false)` when every step was used without success; callers
    /// translate that into their own [`CsiError::Timeout`].
    pub async fn poll<F, Fut>(&self, mut condition: F) -> Result<bool, CsiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, CsiError>>,
    {
        let mut delay = self.initial;
        for step in 0..self.steps {
            if condition().await? {
                return Ok(true);
            }
            if step + 1 == self.steps {
                break;
            }
            debug!(step, delay_ms = delay.as_millis() as u64, "condition not met, backing off");
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(self.factor);
        }
        Ok(false)
    }

    /// Upper bound on the total time [`Self::poll`] spends sleeping.
    pub fn horizon(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut delay = self.initial;
        for _ in 1..self.steps {
            total += delay;
            delay = delay.mul_f64(self.factor);
        }
        total
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
