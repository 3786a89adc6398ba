/*!
 * Runtime Configuration
 *
 * Mode, worker count and queue/persistence settings. Values come from
 * `Default`, builder methods, `RUNNABLE_*` environment variables or JSON.
 */

use super::errors::{RuntimeError, RuntimeResult};
use super::limits::{DEFAULT_WORKERS, MAX_WORKERS};
use super::types::RunningMode;
use crate::ipc::queue::QueueType;
use crate::persistence::ConnectionSharingMode;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

pub const ENV_MODE: &str = "RUNNABLE_MODE";
pub const ENV_WORKERS: &str = "RUNNABLE_WORKERS";
pub const ENV_QUEUE_TYPE: &str = "RUNNABLE_QUEUE_TYPE";
pub const ENV_QUEUE_CAPACITY: &str = "RUNNABLE_QUEUE_CAPACITY";
pub const ENV_DB_POOL_SIZE: &str = "RUNNABLE_DB_POOL_SIZE";
pub const ENV_CONNECTION_SHARING: &str = "RUNNABLE_CONNECTION_SHARING";

/// Settings consumed by the executor and strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    pub mode: RunningMode,
    pub workers: usize,
    pub queue_type: QueueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_pool_size: Option<usize>,
    pub connection_sharing: ConnectionSharingMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RunningMode::MultiThread,
            workers: DEFAULT_WORKERS,
            queue_type: QueueType::Queue,
            queue_capacity: None,
            db_pool_size: None,
            connection_sharing: ConnectionSharingMode::Pooled,
        }
    }
}

impl RuntimeConfig {
    pub fn new(mode: RunningMode, workers: usize) -> Self {
        Self {
            mode,
            workers,
            ..Default::default()
        }
    }

    pub fn with_queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_db_pool_size(mut self, size: usize) -> Self {
        self.db_pool_size = Some(size);
        self
    }

    pub fn with_connection_sharing(mut self, sharing: ConnectionSharingMode) -> Self {
        self.connection_sharing = sharing;
        self
    }

    /// Read overrides from `RUNNABLE_*` environment variables on top of the defaults
    pub fn from_env() -> RuntimeResult<Self> {
        let mut config = Self::default();

        if let Some(mode) = env_value::<RunningMode>(ENV_MODE)? {
            config.mode = mode;
        }
        if let Some(workers) = env_value::<usize>(ENV_WORKERS)? {
            config.workers = workers;
        }
        if let Some(queue_type) = env_value::<QueueType>(ENV_QUEUE_TYPE)? {
            config.queue_type = queue_type;
        }
        config.queue_capacity = env_value::<usize>(ENV_QUEUE_CAPACITY)?.or(config.queue_capacity);
        config.db_pool_size = env_value::<usize>(ENV_DB_POOL_SIZE)?.or(config.db_pool_size);
        if let Some(sharing) = env_value::<ConnectionSharingMode>(ENV_CONNECTION_SHARING)? {
            config.connection_sharing = sharing;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> RuntimeResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RuntimeError::configuration(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.workers == 0 {
            return Err(RuntimeError::configuration("worker count must be positive"));
        }
        if self.workers > MAX_WORKERS {
            return Err(RuntimeError::configuration(format!(
                "worker count {} exceeds limit {}",
                self.workers, MAX_WORKERS
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(RuntimeError::configuration("queue capacity must be positive"));
        }
        if self.db_pool_size == Some(0) {
            return Err(RuntimeError::configuration(
                "database connection pool size must be positive",
            ));
        }
        Ok(())
    }

    /// Connections the persistence collaborator should open for this run.
    ///
    /// `min(workers, cpus)` unless overridden; an override above the CPU
    /// count is honoured with an advisory warning.
    pub fn db_connection_count(&self) -> usize {
        let cpus = num_cpus::get().max(1);
        match self.db_pool_size {
            Some(size) => {
                if size > cpus {
                    warn!(
                        pool_size = size,
                        cpus,
                        "Database connection pool size exceeds CPU count; fewer connections usually perform better"
                    );
                }
                size
            }
            None => self.workers.min(cpus),
        }
    }
}

fn env_value<T>(key: &str) -> RuntimeResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RuntimeError::configuration(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = RuntimeConfig::new(RunningMode::ThreadPool, 0);
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::Configuration(_))
        ));
    }

    #[test]
    fn test_db_connection_count_defaults_to_workers_capped_by_cpus() {
        let config = RuntimeConfig::new(RunningMode::MultiThread, 1);
        assert_eq!(config.db_connection_count(), 1);

        let many = RuntimeConfig::new(RunningMode::MultiThread, MAX_WORKERS);
        assert_eq!(many.db_connection_count(), num_cpus::get().max(1));
    }

    #[test]
    fn test_db_connection_override_above_cpus_is_advisory() {
        let size = num_cpus::get() + 8;
        let config = RuntimeConfig::new(RunningMode::MultiThread, 2).with_db_pool_size(size);
        assert_eq!(config.db_connection_count(), size);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = RuntimeConfig::from_json(r#"{"mode": "process_pool", "workers": 4}"#).unwrap();
        assert_eq!(config.mode, RunningMode::ProcessPool);
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_type, QueueType::Queue);
        assert_eq!(config.connection_sharing, ConnectionSharingMode::Pooled);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(ENV_MODE, "green_thread_pool");
        std::env::set_var(ENV_WORKERS, "3");
        std::env::set_var(ENV_QUEUE_TYPE, "lifo_queue");
        let config = RuntimeConfig::from_env();
        std::env::remove_var(ENV_MODE);
        std::env::remove_var(ENV_WORKERS);
        std::env::remove_var(ENV_QUEUE_TYPE);

        let config = config.unwrap();
        assert_eq!(config.mode, RunningMode::GreenThreadPool);
        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_type, QueueType::LifoQueue);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        std::env::set_var(ENV_WORKERS, "many");
        let result = RuntimeConfig::from_env();
        std::env::remove_var(ENV_WORKERS);
        assert!(matches!(result, Err(RuntimeError::Configuration(_))));
    }
}
