use chrono::{DateTime, Utc};
use std::collections::hash_map::RandomState;
use std::env;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

/// Engine tuning parsed from environment variables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on every single storage call
    pub storage_timeout: Duration,
    /// Bound on the candidate count and on each eviction batch
    pub eviction_timeout: Duration,
    pub inference_ttl: Duration,
    pub training_ttl: Duration,
    pub scheduler_tick: Duration,
    pub metrics_flush_interval: Duration,
    /// Pause after a tick that could not even list policies
    pub error_backoff: Duration,
    pub lease_ttl: Duration,
    pub eviction_batch_size: i64,
    pub query_page_size: i64,
    /// Consecutive storage failures before health reports degraded
    pub degraded_after: u32,
    pub history_limit: usize,
    /// Minimum gap between two raises of the same alert
    pub alert_cooldown: Duration,
    /// Prefix of this process's lease tokens; must differ between replicas
    pub instance_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(5),
            eviction_timeout: Duration::from_secs(5 * 60),
            inference_ttl: Duration::from_secs(6 * 3600),
            training_ttl: Duration::from_secs(30 * 86400),
            scheduler_tick: Duration::from_secs(300),
            metrics_flush_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(3600),
            eviction_batch_size: 1000,
            query_page_size: 500,
            degraded_after: 3,
            history_limit: 100,
            alert_cooldown: Duration::from_secs(15 * 60),
            instance_id: default_instance_id(),
        }
    }
}

/// Host name, pid and a per-process random suffix. Containers all run as pid 1,
/// so the pid alone does not tell replicas apart.
fn default_instance_id() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let suffix = RandomState::new().build_hasher().finish() as u32;
    format!("ml-retention-{}-{}-{:08x}", host, std::process::id(), suffix)
}

/// `value * unit` seconds, or `None` when that does not fit
fn scaled_secs(value: u64, unit: u64) -> Option<Duration> {
    value.checked_mul(unit).map(Duration::from_secs)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl EngineConfig {
    /// Parse configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let secs = |name: &str, default: Duration| {
            env_parse::<u64>(name)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            storage_timeout: secs("STORAGE_TIMEOUT_SECS", defaults.storage_timeout),
            eviction_timeout: secs("EVICTION_TIMEOUT_SECS", defaults.eviction_timeout),
            inference_ttl: env_parse::<u64>("INFERENCE_TTL_HOURS")
                .and_then(|h| scaled_secs(h, 3600))
                .unwrap_or(defaults.inference_ttl),
            training_ttl: env_parse::<u64>("TRAINING_TTL_DAYS")
                .and_then(|d| scaled_secs(d, 86400))
                .unwrap_or(defaults.training_ttl),
            scheduler_tick: secs("SCHEDULER_TICK_SECS", defaults.scheduler_tick),
            metrics_flush_interval: secs("METRICS_FLUSH_SECS", defaults.metrics_flush_interval),
            error_backoff: secs("SCHEDULER_ERROR_BACKOFF_SECS", defaults.error_backoff),
            lease_ttl: secs("LEASE_TTL_SECS", defaults.lease_ttl),
            eviction_batch_size: env_parse("EVICTION_BATCH_SIZE")
                .filter(|n: &i64| *n > 0)
                .unwrap_or(defaults.eviction_batch_size),
            query_page_size: env_parse("QUERY_PAGE_SIZE")
                .filter(|n: &i64| *n > 0)
                .unwrap_or(defaults.query_page_size),
            degraded_after: env_parse("DEGRADED_AFTER_FAILURES").unwrap_or(defaults.degraded_after),
            history_limit: env_parse("EXECUTION_HISTORY_LIMIT").unwrap_or(defaults.history_limit),
            alert_cooldown: secs("ALERT_COOLDOWN_SECS", defaults.alert_cooldown),
            instance_id: env::var("ENGINE_INSTANCE_ID").unwrap_or(defaults.instance_id),
        }
    }
}

/// `now + ttl`, or `None` when the result is past the last representable instant
pub(crate) fn expires_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.inference_ttl, Duration::from_secs(21600));
        assert_eq!(config.training_ttl.as_secs(), 30 * 86400);
        assert_eq!(config.storage_timeout, Duration::from_secs(5));
        assert_eq!(config.degraded_after, 3);
        assert_eq!(config.alert_cooldown, Duration::from_secs(900));
        assert!(config.instance_id.starts_with("ml-retention-"));
    }

    #[test]
    fn test_instance_ids_differ_between_engines() {
        assert_ne!(
            EngineConfig::default().instance_id,
            EngineConfig::default().instance_id
        );
    }

    #[test]
    fn test_scaled_secs_rejects_overflow() {
        assert_eq!(scaled_secs(6, 3600), Some(Duration::from_secs(21600)));
        assert_eq!(scaled_secs(u64::MAX / 1000, 86400), None);
    }

    #[test]
    fn test_expires_after() {
        let now = Utc::now();
        assert_eq!(
            expires_after(now, Duration::from_secs(6 * 3600)),
            Some(now + chrono::Duration::hours(6))
        );
        // in chrono's range as a duration, but past the last representable date
        assert_eq!(expires_after(now, Duration::from_secs(10_000_000_000_000)), None);
        assert_eq!(expires_after(now, Duration::MAX), None);
    }
}
