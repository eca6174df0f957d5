// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Pool configuration surface.
//!
//! Every field has a serde default so a config file only has to name what it
//! overrides; the one mandatory piece is [`WorkerCommand::exec_path`].
//! Durations are stored as raw `*_ms` integers to match the wire-level
//! config keys and exposed as [`std::time::Duration`] through accessors.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use crate::error::{ErrorContext, PoolError};

/// How the worker subprocess is launched.
///
/// Mirrors a process-builder: executable, arguments, environment overlay,
/// working directory. The pool appends nothing; whatever protocol flags the
/// worker needs belong in `args`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Path to the worker executable. Required.
    pub exec_path: PathBuf,
    /// Arguments passed to every spawned worker.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables overlaid on the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory; inherits the pool's own cwd when absent.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(exec_path: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
            ..Self::default()
        }
    }
}

/// Full configuration for one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Name used in logs and error context.
    #[serde(default = "defaults::name")]
    pub name: String,

    /// Target number of live workers.
    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,

    /// Minimum workers that must finish their init handshake for startup to
    /// be considered successful.
    #[serde(default = "defaults::min_ready")]
    pub min_ready: usize,

    /// Pending-request queue saturation bound.
    #[serde(default = "defaults::max_queue_depth")]
    pub max_queue_depth: usize,

    #[serde(default = "defaults::checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,

    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "defaults::init_timeout_ms")]
    pub init_timeout_ms: u64,

    #[serde(default = "defaults::drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Restart budget: at most `max_restarts` replacements within
    /// `max_restarts_window_ms` before the pool declares itself failed.
    #[serde(default = "defaults::max_restarts")]
    pub max_restarts: usize,

    #[serde(default = "defaults::max_restarts_window_ms")]
    pub max_restarts_window_ms: u64,

    /// Upper bound on one wire frame's JSON payload.
    #[serde(default = "defaults::max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Upper bound on one request's serialized `args`.
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "defaults::session_idle_ttl_ms")]
    pub session_idle_ttl_ms: u64,

    #[serde(default = "defaults::max_sessions")]
    pub max_sessions: usize,

    /// Interval between supervisor health probes of idle workers.
    /// `0` disables probing.
    #[serde(default = "defaults::health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "defaults::health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    pub worker: WorkerCommand,
}

mod defaults {
    pub fn name() -> String {
        "default".into()
    }

    /// min(8, logical_cpus × 2); falls back to 8 when parallelism is
    /// unknowable.
    pub fn pool_size() -> usize {
        let cpus = std::thread::available_parallelism().map_or(4, |n| n.get());
        (cpus * 2).min(8)
    }

    pub fn min_ready() -> usize {
        1
    }

    pub fn max_queue_depth() -> usize {
        1000
    }

    pub fn checkout_timeout_ms() -> u64 {
        5000
    }

    pub fn request_timeout_ms() -> u64 {
        30_000
    }

    pub fn init_timeout_ms() -> u64 {
        10_000
    }

    pub fn drain_timeout_ms() -> u64 {
        5000
    }

    pub fn max_restarts() -> usize {
        5
    }

    pub fn max_restarts_window_ms() -> u64 {
        60_000
    }

    pub fn max_frame_bytes() -> usize {
        16 * 1024 * 1024
    }

    pub fn max_message_size() -> usize {
        10 * 1024 * 1024
    }

    pub fn session_idle_ttl_ms() -> u64 {
        3_600_000
    }

    pub fn max_sessions() -> usize {
        10_000
    }

    pub fn health_check_interval_ms() -> u64 {
        30_000
    }

    pub fn health_check_timeout_ms() -> u64 {
        5000
    }
}

impl PoolConfig {
    /// A config with every field defaulted around the given worker command.
    pub fn with_worker(worker: WorkerCommand) -> Self {
        let value = serde_json::json!({ "worker": { "exec_path": "placeholder" } });
        let mut config: Self =
            serde_json::from_value(value).expect("defaulted config must deserialize");
        config.worker = worker;
        config
    }

    /// Checks invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::StartError`] naming the offending field.
    pub fn validate(&self) -> Result<(), PoolError> {
        let fail = |detail: String| {
            Err(PoolError::StartError {
                detail,
                context: ErrorContext::for_pool(&self.name),
            })
        };

        if self.worker.exec_path.as_os_str().is_empty() {
            return fail("worker.exec_path is required".into());
        }
        if self.pool_size == 0 {
            return fail("pool_size must be at least 1".into());
        }
        if self.min_ready == 0 || self.min_ready > self.pool_size {
            return fail(format!(
                "min_ready must be in 1..=pool_size, got {} with pool_size {}",
                self.min_ready, self.pool_size
            ));
        }
        if self.max_message_size > self.max_frame_bytes {
            return fail(format!(
                "max_message_size ({}) cannot exceed max_frame_bytes ({})",
                self.max_message_size, self.max_frame_bytes
            ));
        }
        Ok(())
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn max_restarts_window(&self) -> Duration {
        Duration::from_millis(self.max_restarts_window_ms)
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_millis(self.session_idle_ttl_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_json_config_gets_spec_defaults() {
        let config: PoolConfig = serde_json::from_str(
            r#"{ "worker": { "exec_path": "/usr/local/bin/runtime-worker" } }"#,
        )
        .unwrap();

        assert_eq!(config.name, "default");
        assert_eq!(config.min_ready, 1);
        assert_eq!(config.max_queue_depth, 1000);
        assert_eq!(config.checkout_timeout_ms, 5000);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.init_timeout_ms, 10_000);
        assert_eq!(config.drain_timeout_ms, 5000);
        assert_eq!(config.max_restarts, 5);
        assert_eq!(config.max_restarts_window_ms, 60_000);
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.session_idle_ttl_ms, 3_600_000);
        assert_eq!(config.max_sessions, 10_000);
        assert!(config.pool_size >= 1 && config.pool_size <= 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn worker_command_fields_deserialize() {
        let config: PoolConfig = serde_json::from_str(
            r#"{
                "pool_size": 2,
                "worker": {
                    "exec_path": "/opt/rt/worker",
                    "args": ["--mode", "embedded"],
                    "env": { "RT_HEAP_MB": "256" },
                    "cwd": "/var/lib/rt"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pool_size, 2);
        assert_eq!(config.worker.args, vec!["--mode", "embedded"]);
        assert_eq!(config.worker.env["RT_HEAP_MB"], "256");
        assert_eq!(config.worker.cwd.as_deref().unwrap().to_str(), Some("/var/lib/rt"));
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let mut config = PoolConfig::with_worker(WorkerCommand::new("/bin/worker"));
        config.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = PoolConfig::with_worker(WorkerCommand::new("/bin/worker"));
        config.min_ready = config.pool_size + 1;
        assert!(config.validate().is_err());

        let mut config = PoolConfig::with_worker(WorkerCommand::new("/bin/worker"));
        config.max_message_size = config.max_frame_bytes + 1;
        assert!(config.validate().is_err());

        let config = PoolConfig::with_worker(WorkerCommand::new(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_disables_health_probing() {
        let mut config = PoolConfig::with_worker(WorkerCommand::new("/bin/worker"));
        config.health_check_interval_ms = 0;
        assert_eq!(config.health_check_interval(), None);

        config.health_check_interval_ms = 15_000;
        assert_eq!(
            config.health_check_interval(),
            Some(Duration::from_secs(15))
        );
    }
}
