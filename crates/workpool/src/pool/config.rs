//! Pool manager configuration

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use super::distribute::{default_distribution, Pairing};
use super::task::Task;
use crate::error::PoolError;
use crate::reliability::{duration_millis, option_duration_millis};
use crate::worker::Worker;

type DistributeFn = dyn Fn(&[Worker], &[Task]) -> Vec<Pairing> + Send + Sync;

/// Pluggable pairing of free workers with queued tasks
///
/// Returned pairs may leave either side empty to signal "no match for
/// this slot".
#[derive(Clone)]
pub struct Distributor(Arc<DistributeFn>);

impl Distributor {
    /// Wrap a distribution function
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Worker], &[Task]) -> Vec<Pairing> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Run one distribution pass over snapshots of the lists
    pub fn distribute(&self, free: &[Worker], queued: &[Task]) -> Vec<Pairing> {
        (self.0)(free, queued)
    }
}

impl Default for Distributor {
    fn default() -> Self {
        Self::new(default_distribution)
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Distributor(..)")
    }
}

type InitErrorFn = dyn Fn(&PoolError, &Worker) + Send + Sync;

/// Observe-only hook called when a worker exhausts its start attempts
#[derive(Clone)]
pub struct InitErrorHook(Arc<InitErrorFn>);

impl InitErrorHook {
    /// Wrap an observer
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&PoolError, &Worker) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, error: &PoolError, worker: &Worker) {
        (self.0)(error, worker)
    }
}

impl Default for InitErrorHook {
    fn default() -> Self {
        Self::new(|err, worker| {
            error!(worker = %worker.name(), error = %err, "worker failed to start");
        })
    }
}

impl std::fmt::Debug for InitErrorHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InitErrorHook(..)")
    }
}

/// Pool manager configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use workpool::PoolConfig;
///
/// let config = PoolConfig::default()
///     .with_init_queue_size(4)
///     .with_task_general_attempts(3)
///     .with_task_queue_timeout(Duration::from_secs(30));
/// assert_eq!(config.pool_init_queue_size, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum workers starting at once
    pub pool_init_queue_size: usize,

    /// Default start attempts per worker
    pub pool_init_attempts: u32,

    /// How long a task may wait in the queue before it is canceled
    #[serde(default, with = "option_duration_millis")]
    pub task_queue_timeout: Option<Duration>,

    /// Attempts across different worker assignments
    pub task_general_execute_attempts: u32,

    /// Attempts on the same worker per assignment
    pub task_pool_execute_attempts: u32,

    /// Delay between same-worker attempts
    #[serde(default, with = "duration_millis")]
    pub retry_interval: Duration,

    /// Pairing policy
    #[serde(skip)]
    pub distribute_tasks: Distributor,

    /// Init failure observer
    #[serde(skip)]
    pub pool_init_on_error: InitErrorHook,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_init_queue_size: 1,
            pool_init_attempts: 1,
            task_queue_timeout: None,
            task_general_execute_attempts: 1,
            task_pool_execute_attempts: 1,
            retry_interval: Duration::ZERO,
            distribute_tasks: Distributor::default(),
            pool_init_on_error: InitErrorHook::default(),
        }
    }
}

impl PoolConfig {
    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();
        Self {
            pool_init_queue_size: var("WORKPOOL_INIT_QUEUE_SIZE")
                .unwrap_or(defaults.pool_init_queue_size),
            pool_init_attempts: var("WORKPOOL_INIT_ATTEMPTS").unwrap_or(defaults.pool_init_attempts),
            task_queue_timeout: var::<u64>("WORKPOOL_TASK_QUEUE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .or(defaults.task_queue_timeout),
            task_general_execute_attempts: var("WORKPOOL_TASK_GENERAL_ATTEMPTS")
                .unwrap_or(defaults.task_general_execute_attempts),
            task_pool_execute_attempts: var("WORKPOOL_TASK_POOL_ATTEMPTS")
                .unwrap_or(defaults.task_pool_execute_attempts),
            ..defaults
        }
    }

    /// Set the number of workers started concurrently
    pub fn with_init_queue_size(mut self, size: usize) -> Self {
        self.pool_init_queue_size = size.max(1);
        self
    }

    /// Set the default start attempts
    pub fn with_init_attempts(mut self, attempts: u32) -> Self {
        self.pool_init_attempts = attempts;
        self
    }

    /// Set the queue timeout
    pub fn with_task_queue_timeout(mut self, timeout: Duration) -> Self {
        self.task_queue_timeout = Some(timeout);
        self
    }

    /// Set the cross-worker attempt budget
    pub fn with_task_general_attempts(mut self, attempts: u32) -> Self {
        self.task_general_execute_attempts = attempts;
        self
    }

    /// Set the same-worker attempt budget
    pub fn with_task_pool_attempts(mut self, attempts: u32) -> Self {
        self.task_pool_execute_attempts = attempts;
        self
    }

    /// Set the delay between same-worker attempts
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Replace the distribution policy
    pub fn with_distributor<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Worker], &[Task]) -> Vec<Pairing> + Send + Sync + 'static,
    {
        self.distribute_tasks = Distributor::new(f);
        self
    }

    /// Replace the init failure observer
    pub fn with_init_error_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(&PoolError, &Worker) + Send + Sync + 'static,
    {
        self.pool_init_on_error = InitErrorHook::new(f);
        self
    }
}
