//! End-to-end scheduling flows with in-process workers
//!
//! Run with: cargo test -p workpool --test pool_flow_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use workpool::{
    PoolConfig, PoolError, PoolEvent, PoolManager, Result, TaskOptions, TaskState, Worker,
    WorkerBehavior, WorkerStatus,
};

/// Echoes `index` tasks, throws `error`, panics on `panic`, honors `maxTry` and `sleepMs`
#[derive(Default)]
struct TestWorker {
    start_failures: Mutex<u32>,
    tries_left: Arc<Mutex<HashMap<String, i64>>>,
    executed: Arc<AtomicUsize>,
}

impl TestWorker {
    fn failing_start(times: u32) -> Self {
        Self {
            start_failures: Mutex::new(times),
            ..Default::default()
        }
    }

    fn sharing(tries_left: &Arc<Mutex<HashMap<String, i64>>>, executed: &Arc<AtomicUsize>) -> Self {
        Self {
            start_failures: Mutex::new(0),
            tries_left: tries_left.clone(),
            executed: executed.clone(),
        }
    }
}

#[async_trait]
impl WorkerBehavior for TestWorker {
    async fn start(&self, _worker: &Worker) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let mut failures = self.start_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(PoolError::task("Init error test"));
        }
        Ok(())
    }

    async fn execute_task(&self, _worker: &Worker, content: &Value) -> Result<Value> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let sleep = content.get("sleepMs").and_then(Value::as_u64).unwrap_or(3);
        tokio::time::sleep(Duration::from_millis(sleep)).await;

        if let Some(message) = content.get("panic").and_then(Value::as_str) {
            panic!("{message}");
        }

        if let Some(max_try) = content.get("maxTry").and_then(Value::as_i64) {
            let left = {
                let mut tries = self.tries_left.lock();
                let left = tries.entry(content.to_string()).or_insert(max_try);
                *left -= 1;
                *left
            };
            if left > 0 {
                return Err(PoolError::task("We should try once more for success"));
            }
        }

        match content.get("index") {
            Some(_) => Ok(content.clone()),
            None => Err(PoolError::thrown(content.get("error").cloned().unwrap_or(Value::Null))),
        }
    }
}

/// Panics inside `start`
struct PanickingStart;

#[async_trait]
impl WorkerBehavior for PanickingStart {
    async fn start(&self, _worker: &Worker) -> Result<()> {
        panic!("start exploded");
    }
}

async fn started_pool(config: PoolConfig, count: usize) -> (PoolManager, Vec<Worker>) {
    let manager = PoolManager::new(config);
    let workers: Vec<Worker> = (0..count)
        .map(|_| manager.add_worker(TestWorker::default()))
        .collect();
    manager.start_pools(&workers, None).await.unwrap();
    (manager, workers)
}

#[test_log::test(tokio::test)]
async fn test_fifteen_tasks_on_two_workers() {
    let (manager, workers) = started_pool(PoolConfig::default().with_init_queue_size(2), 2).await;
    assert_eq!(manager.free_workers().len(), 2);

    let tasks: Vec<_> = (0..15)
        .map(|i| manager.proceed_raw_task(json!({ "index": i }), TaskOptions::default()))
        .collect();
    assert_eq!(manager.running_tasks().len(), 2);

    for (i, task) in tasks.iter().enumerate() {
        let result = task.wait().await;
        let worker = result.worker.clone().unwrap();
        assert!(workers.contains(&worker));
        assert_eq!(result.into_result().unwrap(), json!({ "index": i }));
        assert_eq!(task.state(), TaskState::Finished);
    }

    assert!(manager.queued_tasks().is_empty());
    assert!(manager.running_tasks().is_empty());
    assert_eq!(manager.free_workers().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_thrown_values_reach_the_result() {
    let (manager, _workers) = started_pool(PoolConfig::default(), 2).await;

    let tasks: Vec<_> = (1..=3)
        .map(|i| manager.proceed_raw_task(json!({ "error": format!("Error no {i}") }), TaskOptions::default()))
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let (error, value, worker, _) = task.wait().await.into_parts();
        let error = error.unwrap();
        assert_eq!(error.thrown_value(), Some(&json!(format!("Error no {}", i + 1))));
        assert!(value.is_none());
        assert!(worker.is_some());
    }
    // Failed tasks hand their worker back.
    assert_eq!(manager.free_workers().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_general_attempts_requeue_until_success() {
    let tries = Arc::new(Mutex::new(HashMap::new()));
    let executed = Arc::new(AtomicUsize::new(0));
    let manager = PoolManager::new(PoolConfig::default());
    let workers = vec![
        manager.add_worker(TestWorker::sharing(&tries, &executed)),
        manager.add_worker(TestWorker::sharing(&tries, &executed)),
    ];
    manager.start_pools(&workers, None).await.unwrap();

    let task = manager.proceed_raw_task(
        json!({ "index": 7, "maxTry": 3 }),
        TaskOptions::default().with_general_attempts(3),
    );
    let result = task.wait().await;

    assert_eq!(result.into_result().unwrap(), json!({ "index": 7, "maxTry": 3 }));
    assert_eq!(executed.load(Ordering::SeqCst), 3);
    assert_eq!(task.general_attempts_left(), 0);
}

#[test_log::test(tokio::test)]
async fn test_general_attempts_exhausted_keeps_last_error() {
    let (manager, _workers) = started_pool(PoolConfig::default(), 1).await;

    let task = manager.proceed_raw_task(
        json!({ "index": 1, "maxTry": 5 }),
        TaskOptions::default().with_general_attempts(2),
    );
    let err = task.wait().await.into_result().unwrap_err();
    assert_eq!(err.to_string(), "We should try once more for success");
}

#[test_log::test(tokio::test)]
async fn test_pool_attempts_retry_on_same_worker() {
    let config = PoolConfig::default().with_retry_interval(Duration::from_millis(1));
    let (manager, workers) = started_pool(config, 2).await;

    let task = manager.proceed_raw_task(
        json!({ "index": 3, "maxTry": 2 }),
        TaskOptions::default().with_pool_attempts(2),
    );
    let result = task.wait().await;

    assert!(result.is_ok());
    // One assignment, so one general attempt spent.
    assert_eq!(task.general_attempts_left(), 0);
    assert!(workers.contains(result.worker.as_ref().unwrap()));
}

#[test_log::test(tokio::test)]
async fn test_pinned_tasks_wait_for_their_worker() {
    let (manager, workers) = started_pool(PoolConfig::default(), 2).await;
    let pinned = workers[1].clone();

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            manager.proceed_raw_task(
                json!({ "index": i }),
                TaskOptions::default().with_pinned_worker(pinned.clone()),
            )
        })
        .collect();

    for task in tasks {
        let result = task.wait().await;
        assert_eq!(result.worker.as_ref(), Some(&pinned));
        assert!(result.is_ok());
    }
}

#[test_log::test(tokio::test)]
async fn test_queue_timeout_resolves_unstarted_task() {
    let (manager, workers) = started_pool(PoolConfig::default(), 1).await;

    let busy = manager.proceed_raw_task(json!({ "index": 0, "sleepMs": 200 }), TaskOptions::default());
    let waiting = manager.proceed_raw_task(
        json!({ "index": 1 }),
        TaskOptions::default().with_queue_timeout(Duration::from_millis(20)),
    );

    let (error, value, worker, task_id) = waiting.wait().await.into_parts();
    assert!(matches!(error, Some(PoolError::QueueTimeout)));
    assert_eq!(error.unwrap().to_string(), "TIMEOUT");
    assert!(value.is_none());
    assert!(worker.is_none());
    assert_eq!(task_id, waiting.id());
    assert_eq!(waiting.state(), TaskState::Canceled);
    assert!(manager.queued_tasks().is_empty());

    assert!(busy.wait().await.is_ok());
    assert_eq!(workers[0].status(), WorkerStatus::Free);
}

#[test_log::test(tokio::test)]
async fn test_init_failures_and_no_pools() {
    let failures = Arc::new(AtomicUsize::new(0));
    let config = PoolConfig::default().with_init_error_hook({
        let failures = failures.clone();
        move |err: &PoolError, _worker: &Worker| {
            assert!(matches!(err, PoolError::Init { .. }));
            failures.fetch_add(1, Ordering::SeqCst);
        }
    });
    let manager = PoolManager::new(config);
    let workers = vec![
        manager.add_worker(TestWorker::failing_start(10)),
        manager.add_worker(TestWorker::failing_start(10)),
    ];

    let err = manager.start_pools(&workers, Some(3)).await.unwrap_err();
    assert!(matches!(err, PoolError::NoPoolsAvailable));
    assert_eq!(failures.load(Ordering::SeqCst), 2);
    for worker in &workers {
        assert_eq!(worker.status(), WorkerStatus::InitFailed);
        assert_eq!(worker.error().unwrap().to_string(), "Init error test");
    }
}

#[test_log::test(tokio::test)]
async fn test_start_succeeds_within_attempt_budget() {
    let manager = PoolManager::new(PoolConfig::default().with_init_attempts(3));
    let workers = vec![
        manager.add_worker(TestWorker::failing_start(2)),
        manager.add_worker(TestWorker::failing_start(5)),
    ];

    manager.start_pools(&workers, None).await.unwrap();
    assert_eq!(workers[0].status(), WorkerStatus::Free);
    assert_eq!(workers[1].status(), WorkerStatus::InitFailed);
    assert_eq!(manager.free_workers(), vec![workers[0].clone()]);
}

#[test_log::test(tokio::test)]
async fn test_cancel_and_status_are_idempotent() {
    let manager = PoolManager::new(PoolConfig::default());
    let worker = manager.add_worker(TestWorker::default());
    let mut events = manager.subscribe();

    let task = manager.proceed_raw_task(json!({ "index": 1 }), TaskOptions::default());
    assert!(task.cancel("not needed"));
    assert!(!task.cancel("again"));

    let result = task.wait().await;
    assert!(matches!(result.error, Some(PoolError::Canceled(ref reason)) if reason == "not needed"));

    let mut results = 0;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::TaskResult { .. } = event {
            results += 1;
        }
    }
    assert_eq!(results, 1);

    worker.set_status(WorkerStatus::Free);
    worker.set_status(WorkerStatus::Free);
    assert_eq!(manager.free_workers().len(), 1);

    worker.kill().await.unwrap();
    worker.set_status(WorkerStatus::Free);
    assert_eq!(worker.status(), WorkerStatus::Killed);
    assert!(manager.workers().is_empty());
    assert!(manager.free_workers().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_panicking_task_fails_without_losing_the_worker() {
    let (manager, workers) = started_pool(PoolConfig::default(), 1).await;

    let task = manager.proceed_raw_task(json!({ "panic": "task exploded" }), TaskOptions::default());
    let result = task.wait().await;
    assert_eq!(result.worker.as_ref(), Some(&workers[0]));
    let error = result.error.unwrap();
    assert!(error.to_string().contains("task exploded"), "{error}");
    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(workers[0].status(), WorkerStatus::Free);

    let next = manager.proceed_raw_task(json!({ "index": 1 }), TaskOptions::default());
    assert_eq!(next.wait().await.into_result().unwrap(), json!({ "index": 1 }));
}

#[test_log::test(tokio::test)]
async fn test_panicking_start_only_fails_that_worker() {
    let failures = Arc::new(AtomicUsize::new(0));
    let config = PoolConfig::default().with_init_error_hook({
        let failures = failures.clone();
        move |_err: &PoolError, _worker: &Worker| {
            failures.fetch_add(1, Ordering::SeqCst);
        }
    });
    let manager = PoolManager::new(config);
    let workers = vec![
        manager.add_worker(PanickingStart),
        manager.add_worker(TestWorker::default()),
    ];

    manager.start_pools(&workers, None).await.unwrap();

    assert_eq!(workers[0].status(), WorkerStatus::InitFailed);
    assert!(workers[0].error().unwrap().to_string().contains("start exploded"));
    assert_eq!(workers[1].status(), WorkerStatus::Free);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}
