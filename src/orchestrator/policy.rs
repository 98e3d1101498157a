use crate::error_class::{Disposition, ErrorClass};
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_retry_delay_ms() -> u64 {
    10_000
}
fn default_jitter() -> f64 {
    0.2
}

/// What the orchestrator does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try the same target again after `delay`.
    Retry { delay: Duration },
    /// Move on to the next target in the chain.
    Fallback,
    /// Stop the whole chain walk; later targets would fail the same way.
    Abort,
    Cancelled,
}

/// Retry budget and backoff bounds.
///
/// Delays grow as `base_delay * 2^retry`, spread by `±jitter` and capped at
/// `max_retry_delay`. A provider retry hint replaces the computed delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries per target after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Fraction in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// No retries and no delay; every failure falls through to the next target.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_retry_delay_ms: 0,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_retry_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn validate(&self, prefix: &str) -> Result<()> {
        use crate::config::invalid;
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid(
                format!("{}.jitter", prefix),
                "jitter must be within [0, 1]",
                self.jitter.to_string(),
            ));
        }
        if self.max_retry_delay_ms < self.base_delay_ms {
            return Err(invalid(
                format!("{}.max_retry_delay_ms", prefix),
                "max retry delay must not be below the base delay",
                format!(
                    "base_delay_ms={}, max_retry_delay_ms={}",
                    self.base_delay_ms, self.max_retry_delay_ms
                ),
            ));
        }
        Ok(())
    }

    /// Un-jittered exponential delay before retry number `retry` (0-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_retry_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `retry`, honouring a provider hint.
    pub fn backoff_delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let cap = self.max_retry_delay();
        if let Some(hint) = hint {
            return hint.min(cap);
        }
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0)).min(cap)
    }

    /// Next step after attempt `attempt` (0-based) failed with `class`.
    /// `budget` is the number of retries this target allows.
    pub fn decide(
        &self,
        class: ErrorClass,
        attempt: u32,
        budget: u32,
        hint: Option<Duration>,
    ) -> Decision {
        match class.disposition() {
            Disposition::Cancelled => Decision::Cancelled,
            Disposition::Abort => Decision::Abort,
            Disposition::Fallback => Decision::Fallback,
            Disposition::Retry if attempt < budget => Decision::Retry {
                delay: self.backoff_delay(attempt, hint),
            },
            Disposition::Retry => Decision::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy::default()
            .with_delays(Duration::from_millis(100), Duration::from_millis(500))
            .with_jitter(0.0);
        assert_eq!(p.backoff_delay(0, None), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(1, None), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(2, None), Duration::from_millis(400));
        assert_eq!(p.backoff_delay(3, None), Duration::from_millis(500));
        assert_eq!(p.backoff_delay(63, None), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy::default()
            .with_delays(Duration::from_millis(1000), Duration::from_millis(10_000))
            .with_jitter(0.25);
        for _ in 0..200 {
            let d = p.backoff_delay(0, None);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_provider_hint_replaces_backoff() {
        let p = RetryPolicy::default().with_delays(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(
            p.backoff_delay(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            p.backoff_delay(0, Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_decide_by_class() {
        let p = RetryPolicy::none();
        assert_eq!(p.decide(ErrorClass::ServerError, 0, 1, None), Decision::Retry { delay: Duration::ZERO });
        assert_eq!(p.decide(ErrorClass::ServerError, 1, 1, None), Decision::Fallback);
        assert_eq!(p.decide(ErrorClass::NotFound, 0, 3, None), Decision::Fallback);
        assert_eq!(p.decide(ErrorClass::InvalidRequest, 0, 3, None), Decision::Abort);
        assert_eq!(p.decide(ErrorClass::Authentication, 0, 3, None), Decision::Abort);
        assert_eq!(p.decide(ErrorClass::Cancelled, 0, 3, None), Decision::Cancelled);
        assert_eq!(p.decide(ErrorClass::Unknown, 0, 1, None), Decision::Retry { delay: Duration::ZERO });
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        assert!(RetryPolicy::default().with_jitter(1.5).validate("retry").is_err());
        assert!(RetryPolicy::default().validate("retry").is_ok());
    }
}
