//! Worker state machine
//!
//! ```text
//! initQueue ─► initStarting ─┬─► free ◄──► running
//!                            └─► initFailed
//! free | running | initFailed ─► failed
//! any non-terminal ─► killed
//! ```
//!
//! A managed worker is in its manager's free list exactly while its status
//! is `free`. List membership changes happen under the manager lock in the
//! same step as the status change.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::pool::manager::{ManagerShared, PoolLists};
use crate::pool::PoolEvent;
use crate::reliability::Retry;

const EVENT_CAPACITY: usize = 64;

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerStatus {
    InitQueue,
    InitStarting,
    InitFailed,
    Free,
    Running,
    Failed,
    Killed,
}

impl WorkerStatus {
    /// Status name as used on the wire and in events
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::InitQueue => "initQueue",
            WorkerStatus::InitStarting => "initStarting",
            WorkerStatus::InitFailed => "initFailed",
            WorkerStatus::Free => "free",
            WorkerStatus::Running => "running",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Killed => "killed",
        }
    }

    /// Whether the worker is still initializing
    pub fn is_init(&self) -> bool {
        matches!(
            self,
            WorkerStatus::InitQueue | WorkerStatus::InitStarting | WorkerStatus::InitFailed
        )
    }

    /// Whether the status retains an error
    pub fn is_failed(&self) -> bool {
        matches!(self, WorkerStatus::Failed | WorkerStatus::InitFailed)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Status changed
    Status {
        status: WorkerStatus,
        previous: WorkerStatus,
    },
    /// Worker became free and was not claimed by the distribution pass
    Free,
}

impl WorkerEvent {
    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Status { .. } => "status",
            WorkerEvent::Free => "free",
        }
    }
}

/// User logic plugged into a [`Worker`]
///
/// Every hook has a default so implementors override only what they need.
/// In-process workers usually implement `start` and `execute_task`;
/// [`ProcessWorker`](super::ProcessWorker) forwards both to a child
/// process.
#[async_trait]
pub trait WorkerBehavior: Send + Sync + 'static {
    /// Bring the worker up; retried per the start attempt budget
    async fn start(&self, _worker: &Worker) -> Result<()> {
        Ok(())
    }

    /// Run one task
    async fn execute_task(&self, _worker: &Worker, _content: &Value) -> Result<Value> {
        Err(PoolError::MissingExecuteTask)
    }

    /// Decide the worker's next status after an assignment settles
    ///
    /// Called once per assignment, success or failure. The default
    /// returns the worker to `free`.
    fn execute_task_on_result(&self, worker: &Worker, _content: &Value, _outcome: &Result<Value>) {
        worker.set_status(WorkerStatus::Free);
    }

    /// Tear down resources; the worker is marked killed afterwards
    async fn kill(&self, _worker: &Worker) -> Result<()> {
        Ok(())
    }

    /// Restart the worker
    async fn restart(&self, _worker: &Worker) -> Result<()> {
        Err(PoolError::RestartUnsupported)
    }

    /// Answer a message that is not part of the worker protocol
    async fn handle_message(&self, _worker: &Worker, _message: Value) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Behavior with every hook left at its default
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBehavior;

impl WorkerBehavior for DefaultBehavior {}

struct WorkerState {
    status: WorkerStatus,
    error: Option<PoolError>,
}

struct WorkerInner {
    id: Uuid,
    name: String,
    state: Mutex<WorkerState>,
    manager: Weak<ManagerShared>,
    behavior: Arc<dyn WorkerBehavior>,
    events: broadcast::Sender<WorkerEvent>,
}

/// Handle to one schedulable worker
///
/// Cheap to clone; clones refer to the same worker and compare equal.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Worker {}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Worker")
            .field("name", &self.inner.name)
            .field("status", &state.status)
            .field("error", &state.error)
            .finish()
    }
}

impl Worker {
    /// Create a worker without a manager
    pub fn new(name: impl Into<String>, behavior: impl WorkerBehavior) -> Self {
        Self::build(name.into(), Arc::new(behavior), Weak::new())
    }

    /// Create a worker without a manager or custom behavior
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(name, DefaultBehavior)
    }

    pub(crate) fn build(
        name: String,
        behavior: Arc<dyn WorkerBehavior>,
        manager: Weak<ManagerShared>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(WorkerInner {
                id: Uuid::now_v7(),
                name,
                state: Mutex::new(WorkerState {
                    status: WorkerStatus::InitQueue,
                    error: None,
                }),
                manager,
                behavior,
                events,
            }),
        }
    }

    /// Unique id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current status
    pub fn status(&self) -> WorkerStatus {
        self.inner.state.lock().status
    }

    /// Error retained while failed
    pub fn error(&self) -> Option<PoolError> {
        self.inner.state.lock().error.clone()
    }

    /// Free or running
    pub fn is_alive(&self) -> bool {
        matches!(self.status(), WorkerStatus::Free | WorkerStatus::Running)
    }

    /// Ready for a task
    pub fn is_free(&self) -> bool {
        self.status() == WorkerStatus::Free
    }

    /// Terminal
    pub fn is_killed(&self) -> bool {
        self.status() == WorkerStatus::Killed
    }

    /// Whether a manager owns this worker
    pub fn is_managed(&self) -> bool {
        self.inner.manager.strong_count() > 0
    }

    /// The plugged-in behavior
    pub fn behavior(&self) -> &Arc<dyn WorkerBehavior> {
        &self.inner.behavior
    }

    /// Subscribe to status and free notifications
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    fn manager(&self) -> Option<Arc<ManagerShared>> {
        self.inner.manager.upgrade()
    }

    /// Move to a new status
    ///
    /// Setting the current status, or any status after `killed`, is a
    /// no-op. Entering `free` runs a distribution pass before the `free`
    /// notification, which fires only if the worker was not claimed.
    pub fn set_status(&self, status: WorkerStatus) {
        let manager = self.manager();
        let changed = match &manager {
            Some(shared) => {
                let mut lists = shared.lists.lock();
                self.transition(Some(&mut *lists), status)
            }
            None => self.transition(None, status),
        };

        if changed && status == WorkerStatus::Free {
            self.announce_free(manager);
        }
    }

    /// Record an error and move to the matching failed status
    pub fn set_error(&self, error: PoolError) {
        let status = {
            let mut state = self.inner.state.lock();
            if state.status == WorkerStatus::Killed {
                return;
            }
            state.error = Some(error);
            if state.status.is_init() {
                WorkerStatus::InitFailed
            } else {
                WorkerStatus::Failed
            }
        };
        self.set_status(status);
    }

    /// Apply a status change and the matching list updates
    ///
    /// The caller holds the manager lock when `lists` is given. Returns
    /// whether anything changed.
    pub(crate) fn transition(&self, lists: Option<&mut PoolLists>, status: WorkerStatus) -> bool {
        let previous = {
            let mut state = self.inner.state.lock();
            if state.status == status || state.status == WorkerStatus::Killed {
                return false;
            }
            let previous = state.status;
            state.status = status;
            if !status.is_failed() {
                state.error = None;
            }
            previous
        };

        debug!(worker = %self.inner.name, %previous, %status, "worker status changed");
        let _ = self.inner.events.send(WorkerEvent::Status { status, previous });

        if let Some(lists) = lists {
            if status == WorkerStatus::Killed {
                lists.workers.retain(|w| w != self);
                lists.free.retain(|w| w != self);
            } else {
                if previous == WorkerStatus::Free {
                    lists.free.retain(|w| w != self);
                }
                if status == WorkerStatus::Free && !lists.free.contains(self) {
                    lists.free.push(self.clone());
                }
            }
        }
        true
    }

    fn announce_free(&self, manager: Option<Arc<ManagerShared>>) {
        if let Some(shared) = &manager {
            shared.distribute_queued_tasks();
        }
        if self.is_free() {
            let _ = self.inner.events.send(WorkerEvent::Free);
            if let Some(shared) = manager {
                shared.emit(PoolEvent::FreePool(self.clone()));
            }
        }
    }

    /// Start the worker with an attempt budget
    ///
    /// On success the worker becomes free. On exhaustion the last error is
    /// retained, the manager's init hook observes it and the error is
    /// returned for callers that want it.
    #[instrument(skip(self), fields(worker = %self.inner.name))]
    pub async fn start(&self, attempts: u32) -> Result<()> {
        self.set_status(WorkerStatus::InitStarting);

        let behavior = self.inner.behavior.clone();
        let retry = Retry::<PoolError>::attempts(attempts).with_on_error({
            let name = self.inner.name.clone();
            move |err: &PoolError| {
                warn!(worker = %name, error = %err, "start attempt failed");
                async {}
            }
        });

        let attempt = || {
            let (worker, behavior) = (self.clone(), behavior.clone());
            isolate("start", async move { behavior.start(&worker).await })
        };

        match retry.run(attempt).await {
            Ok(()) => {
                self.set_status(WorkerStatus::Free);
                Ok(())
            }
            Err(err) => {
                self.set_error(err.clone());
                if let Some(shared) = self.manager() {
                    let init_error = PoolError::Init {
                        worker: self.inner.name.clone(),
                        source: Box::new(err.clone()),
                    };
                    shared.config.pool_init_on_error.call(&init_error, self);
                }
                Err(err)
            }
        }
    }

    /// Run one task on this worker outside of any manager
    ///
    /// Marks the worker running, runs the task once and hands the outcome
    /// to the result hook before returning it.
    pub async fn execute(&self, content: &Value) -> Result<Value> {
        self.set_status(WorkerStatus::Running);
        self.run_assignment(content, &Retry::attempts(1)).await
    }

    /// Run an assignment on an already-running worker
    ///
    /// Same-worker retries happen here so the result hook fires once.
    pub(crate) async fn run_assignment(&self, content: &Value, retry: &Retry<PoolError>) -> Result<Value> {
        let behavior = self.inner.behavior.clone();
        let attempt = || {
            let (worker, behavior, content) = (self.clone(), behavior.clone(), content.clone());
            isolate("execute_task", async move { behavior.execute_task(&worker, &content).await })
        };
        let outcome = retry.run(attempt).await;

        let hook = AssertUnwindSafe(|| behavior.execute_task_on_result(self, content, &outcome));
        if let Err(payload) = std::panic::catch_unwind(hook) {
            error!(worker = %self.inner.name, panic = %panic_message(payload.as_ref()), "result hook panicked");
        }
        outcome
    }

    /// Kill the worker; it leaves the roster and never transitions again
    pub async fn kill(&self) -> Result<()> {
        let (worker, behavior) = (self.clone(), self.inner.behavior.clone());
        let result = isolate("kill", async move { behavior.kill(&worker).await }).await;
        self.set_status(WorkerStatus::Killed);
        result
    }

    /// Restart the worker through its behavior
    pub async fn restart(&self) -> Result<()> {
        let (worker, behavior) = (self.clone(), self.inner.behavior.clone());
        isolate("restart", async move { behavior.restart(&worker).await }).await
    }

    /// Forward a free-form message to the behavior
    pub async fn handle_message(&self, message: Value) -> Result<Value> {
        let (worker, behavior) = (self.clone(), self.inner.behavior.clone());
        isolate("handle_message", async move { behavior.handle_message(&worker, message).await }).await
    }

    /// Snapshot used by the child runtime's `getState` action
    pub fn state_snapshot(&self) -> Value {
        let state = self.inner.state.lock();
        serde_json::json!({
            "instanceName": self.inner.name,
            "status": state.status,
            "error": state.error.as_ref().map(|e| e.to_fault()),
        })
    }
}

/// Run a behavior hook on its own task so a panic in user code becomes an error
async fn isolate<T, F>(hook: &'static str, future: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(future.in_current_span()).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let message = panic_message(join_err.into_panic().as_ref());
            error!(hook, panic = %message, "worker hook panicked");
            Err(PoolError::task(format!("{hook} panicked: {message}")))
        }
        Err(join_err) => Err(PoolError::task(format!("{hook} was cancelled: {join_err}"))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyStart {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl WorkerBehavior for FlakyStart {
        async fn start(&self, _worker: &Worker) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(PoolError::task(format!("start failure {left}")));
            }
            Ok(())
        }

        async fn execute_task(&self, _worker: &Worker, content: &Value) -> Result<Value> {
            Ok(content.clone())
        }
    }

    fn flaky(failures: u32) -> Worker {
        Worker::new(
            "flaky",
            FlakyStart {
                failures_left: AtomicU32::new(failures),
            },
        )
    }

    #[tokio::test]
    async fn test_new_worker_is_queued_for_init() {
        let worker = Worker::with_name("w");
        assert_eq!(worker.status(), WorkerStatus::InitQueue);
        assert!(!worker.is_alive());
        assert!(!worker.is_managed());
    }

    #[tokio::test]
    async fn test_start_retries_until_free() {
        let worker = flaky(2);
        worker.start(3).await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Free);
        assert!(worker.error().is_none());
    }

    #[tokio::test]
    async fn test_start_exhaustion_keeps_last_error() {
        let worker = flaky(5);
        let err = worker.start(2).await.unwrap_err();

        assert_eq!(err.to_string(), "start failure 4");
        assert_eq!(worker.status(), WorkerStatus::InitFailed);
        assert_eq!(worker.error().map(|e| e.to_string()), Some("start failure 4".into()));
    }

    #[tokio::test]
    async fn test_same_status_is_a_no_op() {
        let worker = Worker::with_name("w");
        let mut events = worker.subscribe();

        worker.set_status(WorkerStatus::Free);
        worker.set_status(WorkerStatus::Free);

        assert_eq!(
            events.try_recv().unwrap(),
            WorkerEvent::Status {
                status: WorkerStatus::Free,
                previous: WorkerStatus::InitQueue
            }
        );
        assert_eq!(events.try_recv().unwrap(), WorkerEvent::Free);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_cleared_when_leaving_failed() {
        let worker = Worker::with_name("w");
        worker.set_status(WorkerStatus::Free);
        worker.set_error(PoolError::task("boom"));

        assert_eq!(worker.status(), WorkerStatus::Failed);
        assert!(worker.error().is_some());

        worker.set_status(WorkerStatus::Free);
        assert!(worker.error().is_none());
    }

    #[tokio::test]
    async fn test_killed_is_terminal() {
        let worker = Worker::with_name("w");
        worker.kill().await.unwrap();
        worker.set_status(WorkerStatus::Free);
        worker.set_error(PoolError::task("late"));

        assert!(worker.is_killed());
        assert!(worker.error().is_none());
    }

    #[tokio::test]
    async fn test_execute_runs_result_hook() {
        let worker = flaky(0);
        worker.start(1).await.unwrap();

        let value = worker.execute(&serde_json::json!({"index": 1})).await.unwrap();
        assert_eq!(value["index"], 1);
        assert!(worker.is_free());
    }

    #[tokio::test]
    async fn test_default_behavior_has_no_task_logic() {
        let worker = Worker::with_name("w");
        let err = worker.execute(&Value::Null).await.unwrap_err();
        assert!(matches!(err, PoolError::MissingExecuteTask));
        assert!(worker.is_free());
        assert!(matches!(worker.restart().await, Err(PoolError::RestartUnsupported)));
    }

    #[tokio::test]
    async fn test_state_snapshot_shape() {
        let worker = Worker::with_name("w");
        worker.set_error(PoolError::task("nope"));

        let snapshot = worker.state_snapshot();
        assert_eq!(snapshot["instanceName"], "w");
        assert_eq!(snapshot["status"], "initFailed");
        assert_eq!(snapshot["error"]["message"], "nope");
    }
}
