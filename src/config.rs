//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `CAIRN_DATABASE_URL`: PostgreSQL connection string (required by the bins)
//! - `CAIRN_LEASE_TTL_SECONDS`: Run lease duration (default: 300)
//! - `CAIRN_STALL_THRESHOLD_SECONDS`: Heartbeat staleness cutoff (default: 120)
//! - `CAIRN_FAILURE_RATIO_THRESHOLD`: Failed fraction that fails a run (default: 0.3)
//! - `CAIRN_BACKOFF_BASE_SECONDS`: First retry delay (default: 30)
//! - `CAIRN_BACKOFF_CAP_SECONDS`: Maximum retry delay (default: 300)
//! - `CAIRN_FAIRNESS_WINDOW_SECONDS`: Dispatch-history window for tenant fairness (default: 300)
//! - `CAIRN_DEDUP_WINDOW_SECONDS`: Recently-identical-query window, 0 disables (default: 0)
//! - `CAIRN_CONFLICT_RETRY_DELAY_MS`: Requeue delay after a version conflict (default: 250)
//! - `CAIRN_LIFECYCLE_POLL_INTERVAL_MS`: Lifecycle dispatcher poll interval (default: 100)
//! - `CAIRN_LIFECYCLE_BATCH_SIZE`: Lifecycle jobs pulled per poll (default: 32)
//! - `CAIRN_DEADLINE_CHECK_INTERVAL_MS`: Deadline monitor interval (default: 5000)
//! - `CAIRN_STALL_CHECK_INTERVAL_MS`: Stall monitor interval (default: 10000)
//! - `CAIRN_PROGRESS_INTERVAL_MS`: Progress monitor interval (default: 15000)
//! - `CAIRN_MONITOR_BATCH_SIZE`: Rows per monitor sweep (default: 100)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Queue that carries lifecycle ticks between orchestrator processes.
pub const LIFECYCLE_QUEUE: &str = "lifecycle";

/// Tunable constants for the orchestrator core. The shipped defaults (0.3
/// failure ratio, 120 s stall, 300 s lease and backoff cap) are starting
/// points, not contracts; tests pass explicit values.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Run lease duration. A crashed holder stalls a run for at most this long.
    pub lease_ttl: Duration,
    /// Heartbeat age past which an assigned/running subtask counts as stalled.
    pub stall_threshold: Duration,
    /// Failed fraction of subtasks past which the whole run fails.
    pub failure_ratio_threshold: f64,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on any retry delay.
    pub backoff_cap: Duration,
    /// Window of dispatch history consulted for tenant fairness.
    pub fairness_window: Duration,
    /// Window for validation-phase query de-duplication. Zero disables it.
    pub dedup_window: Duration,
    /// Requeue delay after losing an optimistic-version race.
    pub conflict_retry_delay: Duration,
    /// Deadline boost windows: (remaining time, priority boost), widest first.
    pub deadline_boosts: [(Duration, i32); 2],
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            stall_threshold: Duration::from_secs(120),
            failure_ratio_threshold: 0.3,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(300),
            fairness_window: Duration::from_secs(300),
            dedup_window: Duration::ZERO,
            conflict_retry_delay: Duration::from_millis(250),
            deadline_boosts: [
                (Duration::from_secs(15 * 60), 10),
                (Duration::from_secs(5 * 60), 20),
            ],
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            lease_ttl: env_duration_secs("CAIRN_LEASE_TTL_SECONDS", defaults.lease_ttl)?,
            stall_threshold: env_duration_secs(
                "CAIRN_STALL_THRESHOLD_SECONDS",
                defaults.stall_threshold,
            )?,
            failure_ratio_threshold: env_parse(
                "CAIRN_FAILURE_RATIO_THRESHOLD",
                defaults.failure_ratio_threshold,
            )?,
            backoff_base: env_duration_secs("CAIRN_BACKOFF_BASE_SECONDS", defaults.backoff_base)?,
            backoff_cap: env_duration_secs("CAIRN_BACKOFF_CAP_SECONDS", defaults.backoff_cap)?,
            fairness_window: env_duration_secs(
                "CAIRN_FAIRNESS_WINDOW_SECONDS",
                defaults.fairness_window,
            )?,
            dedup_window: env_duration_secs("CAIRN_DEDUP_WINDOW_SECONDS", defaults.dedup_window)?,
            conflict_retry_delay: env_duration_millis(
                "CAIRN_CONFLICT_RETRY_DELAY_MS",
                defaults.conflict_retry_delay,
            )?,
            deadline_boosts: defaults.deadline_boosts,
        })
    }
}

/// Settings for the background monitor loops.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub deadline_check_interval: Duration,
    pub stall_check_interval: Duration,
    pub progress_interval: Duration,
    pub batch_size: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            deadline_check_interval: Duration::from_secs(5),
            stall_check_interval: Duration::from_secs(10),
            progress_interval: Duration::from_secs(15),
            batch_size: 100,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            deadline_check_interval: env_duration_millis(
                "CAIRN_DEADLINE_CHECK_INTERVAL_MS",
                defaults.deadline_check_interval,
            )?,
            stall_check_interval: env_duration_millis(
                "CAIRN_STALL_CHECK_INTERVAL_MS",
                defaults.stall_check_interval,
            )?,
            progress_interval: env_duration_millis(
                "CAIRN_PROGRESS_INTERVAL_MS",
                defaults.progress_interval,
            )?,
            batch_size: env_parse("CAIRN_MONITOR_BATCH_SIZE", defaults.batch_size)?,
        })
    }
}

/// Settings for the lifecycle queue dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_concurrent: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 32,
            max_concurrent: num_cpus::get().max(1) * 2,
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: env_duration_millis(
                "CAIRN_LIFECYCLE_POLL_INTERVAL_MS",
                defaults.poll_interval,
            )?,
            batch_size: env_parse("CAIRN_LIFECYCLE_BATCH_SIZE", defaults.batch_size)?,
            max_concurrent: defaults.max_concurrent,
        })
    }
}

pub fn database_url() -> Result<String> {
    env::var("CAIRN_DATABASE_URL").context("CAIRN_DATABASE_URL environment variable required")
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn env_duration_millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(300));
        assert_eq!(config.stall_threshold, Duration::from_secs(120));
        assert!((config.failure_ratio_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.backoff_base, Duration::from_secs(30));
        assert_eq!(config.backoff_cap, Duration::from_secs(300));
        assert_eq!(config.dedup_window, Duration::ZERO);
    }

    #[test]
    fn deadline_boosts_are_ordered_widest_first() {
        let config = OrchestratorConfig::default();
        assert!(config.deadline_boosts[0].0 > config.deadline_boosts[1].0);
        assert!(config.deadline_boosts[0].1 < config.deadline_boosts[1].1);
    }
}
