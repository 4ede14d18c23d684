use std::time::Duration;

use serde::Deserialize;

/// Exponential reconnect delays: `min(base * 2^attempt, cap)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Backoff {
    #[serde(rename = "base_ms", with = "millis")]
    pub base: Duration,
    #[serde(rename = "cap_ms", with = "millis")]
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
        }
    }
}

impl Backoff {
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

/// Delay in milliseconds before reconnect attempt `attempt`, using the default
/// 1s base and 30s cap.
pub fn next_delay(attempt: u32) -> u64 {
    Backoff::default().next_delay(attempt).as_millis() as u64
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
