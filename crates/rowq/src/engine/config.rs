//! Queue engine configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::queue::QueueError;
use crate::reliability::{duration_millis, BackoffPolicy};

/// Which task names the poll loop may claim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimScope {
    /// Only names with a registered handler
    #[default]
    Registered,

    /// Every name; tasks without a handler are failed on dispatch
    All,
}

impl FromStr for ClaimScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "registered" => Ok(Self::Registered),
            "all" => Ok(Self::All),
            other => Err(format!("unknown claim scope: {}", other)),
        }
    }
}

/// Queue engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Unique worker ID stamped on claimed rows (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent in-flight tasks on this instance
    pub concurrency: usize,

    /// Wait between polls when nothing is claimable
    #[serde(with = "duration_millis")]
    pub polling_interval: Duration,

    /// Lease refresh interval for owned rows
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Stuck-task scan interval
    #[serde(with = "duration_millis")]
    pub stuck_check_interval: Duration,

    /// Heartbeat age after which a processing row is considered abandoned
    #[serde(with = "duration_millis")]
    pub stuck_timeout: Duration,

    /// Which names the poll loop claims
    #[serde(default)]
    pub claim_scope: ClaimScope,

    /// Delay applied to retried tasks
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            concurrency: 5,
            polling_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            stuck_check_interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(90),
            claim_scope: ClaimScope::Registered,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            worker_id: lookup("ROWQ_WORKER_ID")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.worker_id),
            concurrency: lookup("ROWQ_CONCURRENCY")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.concurrency),
            polling_interval: millis("ROWQ_POLLING_INTERVAL_MS", defaults.polling_interval),
            heartbeat_interval: millis("ROWQ_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval),
            stuck_check_interval: millis(
                "ROWQ_STUCK_CHECK_INTERVAL_MS",
                defaults.stuck_check_interval,
            ),
            stuck_timeout: millis("ROWQ_STUCK_TIMEOUT_MS", defaults.stuck_timeout),
            claim_scope: lookup("ROWQ_CLAIM_SCOPE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.claim_scope),
            backoff: defaults.backoff,
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stuck_check_interval(mut self, interval: Duration) -> Self {
        self.stuck_check_interval = interval;
        self
    }

    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    pub fn with_claim_scope(mut self, scope: ClaimScope) -> Self {
        self.claim_scope = scope;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker_id.trim().is_empty() {
            return Err(QueueError::InvalidConfig(
                "worker_id must not be empty".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.polling_interval.is_zero() {
            return Err(QueueError::InvalidConfig(
                "polling_interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.stuck_check_interval.is_zero() {
            return Err(QueueError::InvalidConfig(
                "heartbeat and stuck check intervals must be greater than zero".to_string(),
            ));
        }
        if self.stuck_timeout <= self.heartbeat_interval {
            return Err(QueueError::InvalidConfig(format!(
                "stuck_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.stuck_timeout, self.heartbeat_interval
            )));
        }
        self.backoff.validate().map_err(QueueError::InvalidConfig)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();

        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.polling_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.stuck_check_interval, Duration::from_secs(60));
        assert_eq!(config.stuck_timeout, Duration::from_secs(90));
        assert_eq!(config.claim_scope, ClaimScope::Registered);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_ids_are_unique() {
        assert_ne!(QueueConfig::default().worker_id, QueueConfig::default().worker_id);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ROWQ_WORKER_ID", "worker-test"),
            ("ROWQ_CONCURRENCY", "12"),
            ("ROWQ_POLLING_INTERVAL_MS", "250"),
            ("ROWQ_STUCK_TIMEOUT_MS", "not-a-number"),
            ("ROWQ_CLAIM_SCOPE", "ALL"),
        ]
        .into_iter()
        .collect();

        let config = QueueConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.worker_id, "worker-test");
        assert_eq!(config.concurrency, 12);
        assert_eq!(config.polling_interval, Duration::from_millis(250));
        assert_eq!(config.stuck_timeout, Duration::from_secs(90));
        assert_eq!(config.claim_scope, ClaimScope::All);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(QueueConfig::default().with_concurrency(0).validate().is_err());
        assert!(QueueConfig::default()
            .with_polling_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(QueueConfig::default()
            .with_stuck_timeout(Duration::from_secs(30))
            .validate()
            .is_err());
        assert!(QueueConfig::default().with_worker_id(" ").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut json = serde_json::to_value(QueueConfig::default()).unwrap();
        json["backoff"]["multiplier"] = serde_json::json!(-2.0);
        let config: QueueConfig = serde_json::from_value(json).unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backoff multiplier"));
    }

    #[test]
    fn test_serde_round_trip() {
        let config = QueueConfig::default().with_claim_scope(ClaimScope::All);
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["polling_interval"], 1000);
        assert_eq!(json["claim_scope"], "all");

        let back: QueueConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.worker_id, config.worker_id);
        assert_eq!(back.claim_scope, ClaimScope::All);
    }
}
