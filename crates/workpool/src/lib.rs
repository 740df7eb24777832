//! # Worker Pool Task Scheduler
//!
//! An in-memory scheduler that hands queued tasks to a set of interchangeable
//! workers, in-process or in child processes.
//!
//! ## Features
//!
//! - **Worker state machine**: `initStarting` → `free` ⇄ `running` → `killed`, with
//!   retained errors and a free list kept in sync with status
//! - **Two-tier retries**: same-worker attempts with a fixed interval, then
//!   re-queueing across workers until the general attempt budget runs out
//! - **Bounded start-up**: workers start through a bounded-concurrency loop
//! - **Child-process workers**: tasks forwarded over newline-delimited JSON
//!   request/reply on the child's stdin/stdout
//! - **Process supervision**: direct or process-group kill with a liveness check
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PoolManager                           │
//! │  (roster, free list, queued and running tasks, distributor) │
//! └─────────────────────────────────────────────────────────────┘
//!              │ execute                        ▲ result
//!              ▼                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  (status machine, retries, WorkerBehavior hooks)            │
//! └─────────────────────────────────────────────────────────────┘
//!              │ ProcessWorker
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             RpcChannel ── stdio ──► ChildRuntime             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use workpool::{PoolConfig, PoolManager, Result, TaskOptions, Worker, WorkerBehavior};
//!
//! struct Doubler;
//!
//! #[async_trait]
//! impl WorkerBehavior for Doubler {
//!     async fn execute_task(&self, _worker: &Worker, content: &Value) -> Result<Value> {
//!         Ok(json!(content["n"].as_i64().unwrap_or(0) * 2))
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let manager = PoolManager::new(PoolConfig::default().with_task_general_attempts(3));
//! let workers = vec![manager.add_worker(Doubler), manager.add_worker(Doubler)];
//! manager.start_pools(&workers, None).await?;
//!
//! let task = manager.proceed_raw_task(json!({"n": 21}), TaskOptions::default());
//! assert_eq!(task.wait().await.into_result()?, json!(42));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod pool;
pub mod reliability;
pub mod rpc;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{Fault, PoolError, Result};
    pub use crate::pool::{
        PoolConfig, PoolEvent, PoolManager, Task, TaskEvent, TaskOptions, TaskResult, TaskState,
    };
    pub use crate::reliability::{Retry, RetryPolicy};
    pub use crate::worker::{
        ChildRuntime, KillMode, ProcessWorker, ProcessWorkerOptions, Worker, WorkerBehavior,
        WorkerEvent, WorkerStatus,
    };
}

// Re-export key types at crate root
pub use error::{Fault, PoolError, Result};
pub use pool::{
    default_distribution, Distributor, InitErrorHook, Pairing, PoolConfig, PoolEvent, PoolManager,
    Task, TaskEvent, TaskOptions, TaskResult, TaskState,
};
pub use reliability::{ParallelLoop, Retry, RetryPolicy};
pub use rpc::{RpcChannel, RpcDestination, RpcHandler, StdioDestination};
pub use worker::{
    ChildRuntime, DefaultBehavior, KillCallback, KillMode, ProcessWorker, ProcessWorkerOptions,
    Worker, WorkerBehavior, WorkerEvent, WorkerStatus, DEFAULT_KILL_SIGNAL, DEFAULT_KILL_TIMEOUT,
    PROCESS_PROTOCOL_ID,
};
