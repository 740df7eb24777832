//! Task state machine
//!
//! ```text
//! queued ─► running ─► finished
//!   │          │
//!   │          └─► queued   (failed, cross-worker attempts left)
//!   └─► canceled            (explicit cancel or queue timeout)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use super::manager::{ManagerShared, PoolEvent, PoolLists};
use crate::error::{PoolError, Result};
use crate::reliability::{Retry, RetryPolicy};
use crate::worker::{Worker, WorkerStatus};

const EVENT_CAPACITY: usize = 16;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Finished,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Canceled => "canceled",
        }
    }

    /// Finished or canceled
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Canceled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task overrides; unset fields fall back to the manager configuration
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Attempts across different worker assignments
    pub general_attempts: Option<u32>,
    /// Attempts on the same worker per assignment
    pub pool_attempts: Option<u32>,
    /// Cancel the task if it waits in the queue this long
    pub queue_timeout: Option<Duration>,
    /// Only ever run on this worker
    pub pinned_worker: Option<Worker>,
}

impl TaskOptions {
    pub fn with_general_attempts(mut self, attempts: u32) -> Self {
        self.general_attempts = Some(attempts);
        self
    }

    pub fn with_pool_attempts(mut self, attempts: u32) -> Self {
        self.pool_attempts = Some(attempts);
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn with_pinned_worker(mut self, worker: Worker) -> Self {
        self.pinned_worker = Some(worker);
        self
    }
}

/// Options with every default applied
#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    pub general_attempts: u32,
    pub pool_attempts: u32,
    pub retry_interval: Duration,
    pub queue_timeout: Option<Duration>,
    pub pinned_worker: Option<Worker>,
}

impl From<TaskOptions> for TaskSettings {
    fn from(options: TaskOptions) -> Self {
        Self {
            general_attempts: options.general_attempts.unwrap_or(1),
            pool_attempts: options.pool_attempts.unwrap_or(1),
            retry_interval: Duration::ZERO,
            queue_timeout: options.queue_timeout,
            pinned_worker: options.pinned_worker,
        }
    }
}

/// Outcome of a task: `(error, value, worker, task)`
///
/// Exactly one of `error` and `value` is set. `worker` is the worker of the
/// final assignment, or `None` when the task never ran.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub error: Option<PoolError>,
    pub value: Option<Value>,
    pub worker: Option<Worker>,
    pub task: Uuid,
}

impl TaskResult {
    fn failed(task: Uuid, error: PoolError, worker: Option<Worker>) -> Self {
        Self {
            error: Some(error),
            value: None,
            worker,
            task,
        }
    }

    /// Whether the task produced a value
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Value or error, dropping the worker
    pub fn into_result(self) -> Result<Value> {
        match (self.error, self.value) {
            (Some(err), _) => Err(err),
            (None, value) => Ok(value.unwrap_or(Value::Null)),
        }
    }

    /// Split into its four parts
    pub fn into_parts(self) -> (Option<PoolError>, Option<Value>, Option<Worker>, Uuid) {
        (self.error, self.value, self.worker, self.task)
    }
}

/// Task notifications
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Assigned to a worker
    Execute(Worker),
    /// Resolved
    Result(TaskResult),
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Execute(_) => "execute",
            TaskEvent::Result(_) => "result",
        }
    }
}

struct TaskProgress {
    state: TaskState,
    general_attempts: u32,
    worker: Option<Worker>,
    queue_timer: Option<AbortHandle>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

struct TaskInner {
    id: Uuid,
    content: Value,
    created_at: DateTime<Utc>,
    pinned: Option<Worker>,
    pool_retry: Retry<PoolError>,
    manager: Weak<ManagerShared>,
    progress: Mutex<TaskProgress>,
    outcome: watch::Sender<Option<TaskResult>>,
    events: broadcast::Sender<TaskEvent>,
}

/// Handle to one unit of submitted work
///
/// Cheap to clone; clones compare equal. [`Task::wait`] resolves once with
/// the final [`TaskResult`].
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("content", &self.inner.content)
            .finish()
    }
}

impl Task {
    /// Create a queued task without a manager
    ///
    /// Such a task only runs when handed to a worker with
    /// [`Task::execute`]. A queue timeout needs a Tokio runtime.
    pub fn new(content: Value, options: TaskOptions) -> Self {
        Self::create(content, options.into(), Weak::new())
    }

    pub(crate) fn create(content: Value, settings: TaskSettings, manager: Weak<ManagerShared>) -> Self {
        let (outcome, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let policy = RetryPolicy::fixed(settings.retry_interval, settings.pool_attempts);

        let task = Self {
            inner: Arc::new(TaskInner {
                id: Uuid::now_v7(),
                content,
                created_at: Utc::now(),
                pinned: settings.pinned_worker,
                pool_retry: Retry::new(policy),
                manager,
                progress: Mutex::new(TaskProgress {
                    state: TaskState::Queued,
                    general_attempts: settings.general_attempts,
                    worker: None,
                    queue_timer: None,
                    started_at: None,
                    finished_at: None,
                }),
                outcome,
                events,
            }),
        };

        if let Some(timeout) = settings.queue_timeout {
            let weak = Arc::downgrade(&task.inner);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    Task { inner }.cancel_with(PoolError::QueueTimeout);
                }
            });
            task.inner.progress.lock().queue_timer = Some(timer.abort_handle());
        }

        task
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Opaque payload handed to the worker
    pub fn content(&self) -> &Value {
        &self.inner.content
    }

    pub fn state(&self) -> TaskState {
        self.inner.progress.lock().state
    }

    /// Worker this task is pinned to
    pub fn pinned_worker(&self) -> Option<Worker> {
        self.inner.pinned.clone()
    }

    pub fn is_pinned(&self) -> bool {
        self.inner.pinned.is_some()
    }

    /// Worker of the current or last assignment
    pub fn worker(&self) -> Option<Worker> {
        self.inner.progress.lock().worker.clone()
    }

    /// Cross-worker attempts left
    pub fn general_attempts_left(&self) -> u32 {
        self.inner.progress.lock().general_attempts
    }

    /// Same-worker attempts per assignment
    pub fn pool_attempts(&self) -> u32 {
        self.inner.pool_retry.policy().max_attempts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// When the latest assignment started
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.progress.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.progress.lock().finished_at
    }

    /// Final result, if resolved
    pub fn result(&self) -> Option<TaskResult> {
        self.inner.outcome.borrow().clone()
    }

    /// Subscribe to execute and result notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for the task to resolve
    pub async fn wait(&self) -> TaskResult {
        let mut rx = self.inner.outcome.subscribe();
        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|result| (*result).clone());
        resolved.unwrap_or_else(|| {
            TaskResult::failed(self.id(), PoolError::Canceled("task was dropped".into()), None)
        })
    }

    fn manager(&self) -> Option<Arc<ManagerShared>> {
        self.inner.manager.upgrade()
    }

    /// Hand a queued task to a worker
    ///
    /// Returns false if the task is no longer queued.
    pub fn execute(&self, worker: &Worker) -> bool {
        match self.manager() {
            Some(shared) => {
                let mut lists = shared.lists.lock();
                self.execute_locked(Some(&mut *lists), worker)
            }
            None => self.execute_locked(None, worker),
        }
    }

    /// Claim the worker and start the assignment
    ///
    /// Runs under the manager lock when `lists` is given: the worker leaves
    /// the free list and the task moves to the running list in one step.
    pub(crate) fn execute_locked(&self, lists: Option<&mut PoolLists>, worker: &Worker) -> bool {
        {
            let mut progress = self.inner.progress.lock();
            if progress.state != TaskState::Queued {
                return false;
            }
            progress.state = TaskState::Running;
            progress.worker = Some(worker.clone());
            progress.started_at = Some(Utc::now());
            if let Some(timer) = progress.queue_timer.take() {
                timer.abort();
            }
        }

        let mut lists = lists;
        worker.transition(lists.as_deref_mut(), WorkerStatus::Running);
        if let Some(lists) = lists {
            lists.queued.retain(|t| t != self);
            lists.running.push(self.clone());
        }

        debug!(task_id = %self.inner.id, worker = %worker.name(), "task assigned");
        let _ = self.inner.events.send(TaskEvent::Execute(worker.clone()));
        if let Some(shared) = self.manager() {
            shared.emit(PoolEvent::TaskExecute {
                task: self.clone(),
                worker: worker.clone(),
            });
        }

        let task = self.clone();
        let worker = worker.clone();
        tokio::spawn(async move {
            let result = worker
                .run_assignment(&task.inner.content, &task.inner.pool_retry)
                .await;
            task.settle(worker, result);
        });
        true
    }

    /// Apply the outcome of one assignment
    fn settle(&self, worker: Worker, result: Result<Value>) {
        let manager = self.manager();
        let requeue = {
            let mut lists = manager.as_ref().map(|shared| shared.lists.lock());
            let requeue = {
                let mut progress = self.inner.progress.lock();
                if progress.state != TaskState::Running {
                    return;
                }
                progress.general_attempts = progress.general_attempts.saturating_sub(1);
                if result.is_err() && progress.general_attempts > 0 {
                    progress.state = TaskState::Queued;
                    true
                } else {
                    progress.state = TaskState::Finished;
                    progress.finished_at = Some(Utc::now());
                    false
                }
            };
            if let Some(lists) = lists.as_deref_mut() {
                lists.running.retain(|t| t != self);
                if requeue {
                    lists.queued.push(self.clone());
                }
            }
            requeue
        };

        if requeue {
            if let Err(err) = &result {
                debug!(
                    task_id = %self.inner.id,
                    worker = %worker.name(),
                    error = %err,
                    attempts_left = self.general_attempts_left(),
                    "task failed, requeueing"
                );
            }
            if let Some(shared) = manager {
                shared.distribute_queued_tasks();
            }
            return;
        }

        let (error, value) = match result {
            Ok(value) => (None, Some(value)),
            Err(err) => (Some(err), None),
        };
        self.publish(
            TaskResult {
                error,
                value,
                worker: Some(worker),
                task: self.inner.id,
            },
            manager,
        );
    }

    /// Cancel a queued task
    ///
    /// Returns false (and does nothing) once the task has started.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.cancel_with(PoolError::Canceled(reason.into()))
    }

    fn cancel_with(&self, error: PoolError) -> bool {
        let manager = self.manager();
        {
            let mut lists = manager.as_ref().map(|shared| shared.lists.lock());
            {
                let mut progress = self.inner.progress.lock();
                if progress.state != TaskState::Queued {
                    return false;
                }
                progress.state = TaskState::Canceled;
                progress.finished_at = Some(Utc::now());
                if let Some(timer) = progress.queue_timer.take() {
                    timer.abort();
                }
            }
            if let Some(lists) = lists.as_deref_mut() {
                lists.queued.retain(|t| t != self);
            }
        }

        debug!(task_id = %self.inner.id, error = %error, "task canceled");
        self.publish(TaskResult::failed(self.inner.id, error, None), manager);
        true
    }

    fn publish(&self, result: TaskResult, manager: Option<Arc<ManagerShared>>) {
        self.inner.outcome.send_replace(Some(result.clone()));
        let _ = self.inner.events.send(TaskEvent::Result(result.clone()));
        if let Some(shared) = manager {
            shared.emit(PoolEvent::TaskResult {
                task: self.clone(),
                result,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerBehavior;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl WorkerBehavior for Echo {
        async fn execute_task(&self, _worker: &Worker, content: &Value) -> Result<Value> {
            match content.get("error") {
                Some(err) => Err(PoolError::thrown(err.clone())),
                None => Ok(content.clone()),
            }
        }
    }

    async fn free_worker() -> Worker {
        let worker = Worker::new("echo", Echo);
        worker.start(1).await.unwrap();
        worker
    }

    #[tokio::test]
    async fn test_execute_resolves_with_value_and_worker() {
        let worker = free_worker().await;
        let task = Task::new(json!({"index": 3}), TaskOptions::default());

        assert!(task.execute(&worker));
        let result = task.wait().await;

        assert!(result.is_ok());
        assert_eq!(result.value, Some(json!({"index": 3})));
        assert_eq!(result.worker.as_ref(), Some(&worker));
        assert_eq!(result.task, task.id());
        assert_eq!(task.state(), TaskState::Finished);
        assert!(worker.is_free());
        assert!(task.started_at().is_some() && task.finished_at().is_some());
    }

    #[tokio::test]
    async fn test_thrown_value_is_delivered_unchanged() {
        let worker = free_worker().await;
        let task = Task::new(json!({"error": "Error no 4"}), TaskOptions::default());

        task.execute(&worker);
        let (error, value, _worker, _id) = task.wait().await.into_parts();

        assert!(value.is_none());
        assert_eq!(error.unwrap().thrown_value(), Some(&json!("Error no 4")));
    }

    #[tokio::test]
    async fn test_cancel_only_while_queued() {
        let worker = free_worker().await;
        let queued = Task::new(json!({"index": 1}), TaskOptions::default());
        assert!(queued.cancel("not needed"));
        assert!(!queued.execute(&worker));

        let result = queued.wait().await;
        assert!(matches!(result.error, Some(PoolError::Canceled(ref r)) if r == "not needed"));
        assert!(result.worker.is_none());
        assert_eq!(queued.state(), TaskState::Canceled);

        let running = Task::new(json!({"index": 2}), TaskOptions::default());
        running.execute(&worker);
        assert!(!running.cancel("too late"));
        assert!(running.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_timeout_cancels() {
        let task = Task::new(
            json!({"index": 1}),
            TaskOptions::default().with_queue_timeout(Duration::from_millis(20)),
        );

        let result = task.wait().await;
        assert!(matches!(result.error, Some(PoolError::QueueTimeout)));
        assert_eq!(task.state(), TaskState::Canceled);
    }

    #[tokio::test]
    async fn test_execution_clears_queue_timer() {
        let worker = free_worker().await;
        let task = Task::new(
            json!({"index": 1}),
            TaskOptions::default().with_queue_timeout(Duration::from_millis(30)),
        );
        task.execute(&worker);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_events_fire_in_order() {
        let worker = free_worker().await;
        let task = Task::new(json!({"index": 1}), TaskOptions::default());
        let mut events = task.subscribe();

        task.execute(&worker);
        task.wait().await;

        assert_eq!(events.recv().await.unwrap().name(), "execute");
        assert_eq!(events.recv().await.unwrap().name(), "result");
    }
}
