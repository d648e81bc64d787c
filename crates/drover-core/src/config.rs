//! Service configuration from environment variables.
//!
//! Every knob has a default so a bare `drover` start against a local
//! database works. Unparseable values fall back to the default rather than
//! aborting startup.

use std::env;
use std::time::Duration;

/// Runtime configuration for the dispatch engine.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Number of in-process worker loops to host.
    pub num_internal_workers: usize,
    /// Boot the worker pool on service start.
    pub auto_start_workers: bool,
    /// Run the timeout sweeper.
    pub enable_background_tasks: bool,
    /// Deadline applied when a task omits `timeout_minutes`. Fractional
    /// minutes are allowed.
    pub default_timeout_minutes: f64,
    /// Step budget applied when a task omits `max_steps`.
    pub default_max_steps: i64,
    /// Priority applied when a task omits `priority`.
    pub default_priority: i32,
    /// Cadence of the timeout sweeper.
    pub timeout_check_interval: Duration,
    /// Cadence of each worker loop's claim poll.
    pub worker_poll_interval: Duration,
    /// A worker that has not heartbeat within this window is not claimable
    /// and will be marked offline by the sweeper.
    pub worker_heartbeat_timeout: Duration,
}

impl ServiceConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            num_internal_workers: env_parse("NUM_INTERNAL_WORKERS", 2),
            auto_start_workers: env_bool("AUTO_START_WORKERS", true),
            enable_background_tasks: env_bool("ENABLE_BACKGROUND_TASKS", true),
            default_timeout_minutes: env_parse("DEFAULT_TIMEOUT_MINUTES", 30.0),
            default_max_steps: env_parse("DEFAULT_MAX_STEPS", 30),
            default_priority: env_parse("DEFAULT_PRIORITY", 0),
            timeout_check_interval: Duration::from_secs_f64(env_parse(
                "TIMEOUT_CHECK_INTERVAL",
                60.0,
            )),
            worker_poll_interval: Duration::from_secs_f64(env_parse(
                "WORKER_POLL_INTERVAL",
                1.0,
            )),
            worker_heartbeat_timeout: Duration::from_secs_f64(env_parse(
                "WORKER_HEARTBEAT_TIMEOUT",
                90.0,
            )),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            num_internal_workers: 2,
            auto_start_workers: true,
            enable_background_tasks: true,
            default_timeout_minutes: 30.0,
            default_max_steps: 30,
            default_priority: 0,
            timeout_check_interval: Duration::from_secs(60),
            worker_poll_interval: Duration::from_secs(1),
            worker_heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.default_timeout_minutes, 30.0);
        assert_eq!(cfg.worker_poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.timeout_check_interval, Duration::from_secs(60));
        assert!(cfg.auto_start_workers);
    }

    #[test]
    fn unparseable_env_falls_back_to_default() {
        unsafe { std::env::set_var("DROVER_TEST_BAD_NUMBER", "not-a-number") };
        let parsed: usize = env_parse("DROVER_TEST_BAD_NUMBER", 7);
        assert_eq!(parsed, 7);
        unsafe { std::env::remove_var("DROVER_TEST_BAD_NUMBER") };
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        unsafe { std::env::set_var("DROVER_TEST_FLAG", "YES") };
        assert!(env_bool("DROVER_TEST_FLAG", false));
        unsafe { std::env::set_var("DROVER_TEST_FLAG", "0") };
        assert!(!env_bool("DROVER_TEST_FLAG", true));
        unsafe { std::env::remove_var("DROVER_TEST_FLAG") };
    }
}
