// Telemetry Module
//
// Installs the tracing subscriber used by processes embedding the queue.
// Decision: plain fmt output by default, JSON lines when ROWQ_LOG_JSON is set

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SERVICE_NAME: &str = "rowq";
const DEFAULT_LOG_FILTER: &str = "info";

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Configuration for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "rowq=debug")
    pub log_filter: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            log_filter: None,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `ROWQ_SERVICE_NAME`: Service name (default: "rowq")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `ROWQ_LOG_JSON`: "true" or "1" for JSON output
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            service_name: lookup("ROWQ_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            log_filter: lookup("RUST_LOG").or_else(|| lookup("LOG_LEVEL")),
            json: lookup("ROWQ_LOG_JSON")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1"))
                .unwrap_or(false),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global tracing subscriber
///
/// Returns `false` if a subscriber was already installed, which makes repeated
/// calls (tests, embedding applications) harmless.
///
/// # Example
///
/// ```no_run
/// use rowq::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::from_env());
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let (plain_layer, json_layer) = if config.json {
        (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
        )
    } else {
        (Some(tracing_subscriber::fmt::layer().with_target(true)), None)
    };

    let installed = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(plain_layer)
        .with(json_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = %config.service_name, json = config.json, "telemetry initialized");
    }
    installed
}
