//! Engine configuration.

use std::time::Duration;

/// Tunables for saga dispatch, timeout, and reconciliation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a saga may sit untouched before it is considered stalled.
    pub saga_timeout: Duration,
    /// Dispatch attempts allowed per step before giving up on it.
    pub max_retries: u32,
    /// Minimum wait between dispatch attempts for the same step.
    pub retry_backoff: Duration,
    /// How often the background reconciler sweeps non-terminal sagas.
    pub reconcile_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            saga_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Builds the configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    ///
    /// Recognized variables: `SAGA_TIMEOUT_MS`, `SAGA_MAX_RETRIES`,
    /// `SAGA_RETRY_BACKOFF_MS`, `SAGA_RECONCILE_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            saga_timeout: env_millis("SAGA_TIMEOUT_MS").unwrap_or(defaults.saga_timeout),
            max_retries: env_parse("SAGA_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_backoff: env_millis("SAGA_RETRY_BACKOFF_MS").unwrap_or(defaults.retry_backoff),
            reconcile_interval: env_millis("SAGA_RECONCILE_INTERVAL_MS")
                .unwrap_or(defaults.reconcile_interval),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}
