//! Pool manager
//!
//! Owns the worker roster, the free-worker list and the queued/running task
//! lists. All list mutation happens under one lock, inside the worker and
//! task transitions; the lock is never held across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::config::PoolConfig;
use super::task::{Task, TaskOptions, TaskResult, TaskSettings, TaskState};
use crate::error::{PoolError, Result};
use crate::reliability::ParallelLoop;
use crate::worker::{Worker, WorkerBehavior};

const EVENT_CAPACITY: usize = 1024;

/// Manager notifications
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker became free and was not immediately claimed
    FreePool(Worker),
    /// A task was submitted
    TaskInit(Task),
    /// A task was handed to a worker
    TaskExecute { task: Task, worker: Worker },
    /// A task resolved
    TaskResult { task: Task, result: TaskResult },
}

impl PoolEvent {
    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::FreePool(_) => "freePool",
            PoolEvent::TaskInit(_) => "taskInit",
            PoolEvent::TaskExecute { .. } => "taskExecute",
            PoolEvent::TaskResult { .. } => "taskResult",
        }
    }
}

/// Lists guarded by the manager lock
#[derive(Default)]
pub(crate) struct PoolLists {
    pub(crate) workers: Vec<Worker>,
    pub(crate) free: Vec<Worker>,
    pub(crate) queued: Vec<Task>,
    pub(crate) running: Vec<Task>,
}

/// State shared between the manager handle, its workers and its tasks
///
/// Workers and tasks hold this weakly.
pub(crate) struct ManagerShared {
    pub(crate) config: PoolConfig,
    pub(crate) lists: Mutex<PoolLists>,
    events: broadcast::Sender<PoolEvent>,
    worker_seq: AtomicU64,
}

impl ManagerShared {
    pub(crate) fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Pair free workers with queued tasks until no pair can be made
    ///
    /// The distributor sees snapshots taken outside the lock; every pair it
    /// returns is checked again under the lock before the task starts.
    pub(crate) fn distribute_queued_tasks(&self) {
        loop {
            let (free, queued) = {
                let lists = self.lists.lock();
                if lists.free.is_empty() || lists.queued.is_empty() {
                    return;
                }
                (lists.free.clone(), lists.queued.clone())
            };

            let pairs = self.config.distribute_tasks.distribute(&free, &queued);
            if pairs.is_empty() {
                return;
            }

            let mut started = 0usize;
            {
                let mut lists = self.lists.lock();
                for (worker, task) in pairs {
                    let (Some(worker), Some(task)) = (worker, task) else {
                        continue;
                    };
                    if !lists.free.contains(&worker) || task.state() != TaskState::Queued {
                        continue;
                    }
                    if task.execute_locked(Some(&mut *lists), &worker) {
                        started += 1;
                    }
                }
            }

            debug!(started, "distribution pass");
            if started == 0 {
                return;
            }
        }
    }
}

/// Orchestrates workers and tasks
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use workpool::{PoolConfig, PoolManager, Result, TaskOptions, Worker, WorkerBehavior};
///
/// struct Echo;
///
/// #[async_trait]
/// impl WorkerBehavior for Echo {
///     async fn execute_task(&self, _worker: &Worker, content: &Value) -> Result<Value> {
///         Ok(content.clone())
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let manager = PoolManager::new(PoolConfig::default());
/// let workers = vec![manager.add_worker(Echo), manager.add_worker(Echo)];
/// manager.start_pools(&workers, None).await.unwrap();
///
/// let task = manager.proceed_raw_task(json!({"index": 1}), TaskOptions::default());
/// let result = task.wait().await;
/// assert_eq!(result.value, Some(json!({"index": 1})));
/// # });
/// ```
#[derive(Clone)]
pub struct PoolManager {
    shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.shared.lists.lock();
        f.debug_struct("PoolManager")
            .field("workers", &lists.workers.len())
            .field("free", &lists.free.len())
            .field("queued", &lists.queued.len())
            .field("running", &lists.running.len())
            .finish()
    }
}

impl PoolManager {
    /// Create a manager
    pub fn new(config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(ManagerShared {
                config,
                lists: Mutex::new(PoolLists::default()),
                events,
                worker_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Subscribe to manager notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Add a worker named from the manager's sequence (`worker-0`, ...)
    pub fn add_worker(&self, behavior: impl WorkerBehavior) -> Worker {
        let n = self.shared.worker_seq.fetch_add(1, Ordering::Relaxed);
        self.add_named_worker(format!("worker-{}", n), behavior)
    }

    /// Add a worker with an explicit name
    ///
    /// The worker joins the roster in `initQueue`; it becomes usable after
    /// [`PoolManager::start_pools`].
    pub fn add_named_worker(&self, name: impl Into<String>, behavior: impl WorkerBehavior) -> Worker {
        self.add_shared_worker(name.into(), Arc::new(behavior))
    }

    /// Add a worker whose behavior is already shared
    pub fn add_shared_worker(&self, name: String, behavior: Arc<dyn WorkerBehavior>) -> Worker {
        let worker = Worker::build(name, behavior, Arc::downgrade(&self.shared));
        self.shared.lists.lock().workers.push(worker.clone());
        worker
    }

    /// Start workers with bounded concurrency
    ///
    /// A worker that fails to start keeps its error in its own state and
    /// does not stop its siblings. Fails only when afterwards there is no
    /// free worker and no running task.
    #[instrument(skip(self, workers), fields(count = workers.len()))]
    pub async fn start_pools(&self, workers: &[Worker], attempts: Option<u32>) -> Result<()> {
        let attempts = attempts.unwrap_or(self.shared.config.pool_init_attempts);
        let concurrency = self.shared.config.pool_init_queue_size;
        info!(concurrency, attempts, "starting pools");

        ParallelLoop::new(concurrency)
            .for_each_array(workers.to_vec(), move |worker, _index, _all| async move {
                if let Err(err) = worker.start(attempts).await {
                    debug!(worker = %worker.name(), error = %err, "worker did not start");
                }
                Ok::<(), PoolError>(())
            })
            .await?;

        let lists = self.shared.lists.lock();
        if lists.free.is_empty() && lists.running.is_empty() {
            warn!("no pools are available after start");
            return Err(PoolError::NoPoolsAvailable);
        }
        info!(free = lists.free.len(), "pools started");
        Ok(())
    }

    /// Run a distribution pass
    pub fn distribute_queued_tasks(&self) {
        self.shared.distribute_queued_tasks();
    }

    /// Submit work
    ///
    /// Unset options take the configured defaults. The task is queued and
    /// a distribution pass runs before this returns.
    pub fn proceed_raw_task(&self, content: Value, options: TaskOptions) -> Task {
        let config = &self.shared.config;
        let settings = TaskSettings {
            general_attempts: options
                .general_attempts
                .unwrap_or(config.task_general_execute_attempts),
            pool_attempts: options
                .pool_attempts
                .unwrap_or(config.task_pool_execute_attempts),
            retry_interval: config.retry_interval,
            queue_timeout: options.queue_timeout.or(config.task_queue_timeout),
            pinned_worker: options.pinned_worker,
        };

        let task = Task::create(content, settings, Arc::downgrade(&self.shared));
        {
            let mut lists = self.shared.lists.lock();
            // A zero timeout may already have canceled it.
            if task.state() == TaskState::Queued {
                lists.queued.push(task.clone());
            }
        }
        debug!(task_id = %task.id(), "task queued");
        self.shared.emit(PoolEvent::TaskInit(task.clone()));
        self.shared.distribute_queued_tasks();
        task
    }

    /// Full worker roster
    pub fn workers(&self) -> Vec<Worker> {
        self.shared.lists.lock().workers.clone()
    }

    /// Workers waiting for a task
    pub fn free_workers(&self) -> Vec<Worker> {
        self.shared.lists.lock().free.clone()
    }

    /// Tasks waiting for a worker
    pub fn queued_tasks(&self) -> Vec<Task> {
        self.shared.lists.lock().queued.clone()
    }

    /// Tasks currently assigned
    pub fn running_tasks(&self) -> Vec<Task> {
        self.shared.lists.lock().running.clone()
    }

    /// Cancel queued tasks and kill every worker
    ///
    /// Kill failures are logged, never returned. Returns the number of
    /// workers killed.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> usize {
        for task in self.queued_tasks() {
            task.cancel("pool shutdown");
        }

        let workers = self.workers();
        info!(workers = workers.len(), "shutting down pool");
        let outcomes = futures::future::join_all(workers.iter().map(|worker| async move {
            if let Err(err) = worker.kill().await {
                warn!(worker = %worker.name(), error = %err, "kill failed");
            }
            worker.is_killed()
        }))
        .await;

        let killed = outcomes.into_iter().filter(|killed| *killed).count();
        info!(killed, "pool shut down");
        killed
    }
}
