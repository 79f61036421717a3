//! Retry backoff computation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration_millis;

/// Delay applied to `run_at` when a failed task is requeued
///
/// The delay after attempt `n` (1-based) is
/// `min(base * multiplier^(n-1), max)`, optionally jittered.
///
/// # Example
///
/// ```
/// use rowq::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::default();
///
/// assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
/// assert_eq!(policy.delay_after_attempt(10), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    #[serde(with = "duration_millis")]
    pub base: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means +/-10% randomness.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl BackoffPolicy {
    /// Doubling backoff: 1s, 2s, 4s, ... capped at 60s, no jitter
    pub fn exponential() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    /// Constant delay between attempts
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            multiplier: 1.0,
            max: interval,
            jitter: 0.0,
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry that follows attempt `attempt` (1-based)
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        // NaN growth falls back to `max`, negative growth to zero
        let capped = raw.min(self.max.as_secs_f64()).max(0.0);
        let jitter = self.jitter.clamp(0.0, 1.0);

        let jittered = if jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max)
    }

    /// Check fields that deserialization does not constrain
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "backoff multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!(
                "backoff jitter must be within 0.0-1.0, got {}",
                self.jitter
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_doubles_from_one_second() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after_attempt(6), Duration::from_secs(32));
    }

    #[test]
    fn test_capped_at_max() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_after_attempt(7), Duration::from_secs(60));
        assert_eq!(policy.delay_after_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));

        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::default().with_jitter(0.2);

        for _ in 0..100 {
            let delay = policy.delay_after_attempt(2);
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_serde_uses_millis() {
        let policy = BackoffPolicy::default();
        let json = serde_json::to_value(&policy).unwrap();

        assert_eq!(json["base"], 1000);
        assert_eq!(json["max"], 60000);

        let back: BackoffPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_deserialized_negative_multiplier_never_goes_below_zero() {
        let policy: BackoffPolicy = serde_json::from_value(serde_json::json!({
            "base": 1000,
            "multiplier": -2.0,
            "max": 60000,
            "jitter": 0.0
        }))
        .unwrap();

        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::ZERO);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_out_of_range_fields_do_not_panic() {
        let mut policy = BackoffPolicy::default();
        policy.multiplier = f64::NAN;
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(60));

        policy.multiplier = 2.0;
        policy.jitter = 5.0;
        assert!(policy.delay_after_attempt(2) <= Duration::from_secs(4));
        assert!(policy.validate().is_err());

        assert!(BackoffPolicy::default().with_jitter(0.5).validate().is_ok());
    }
}
