//! Workers: the state machine and its in-process and child-process variants
//!
//! This module provides:
//! - [`Worker`] - One schedulable unit with its status and retained error
//! - [`WorkerBehavior`] - User logic plugged into a worker
//! - [`ProcessWorker`] - Behavior that runs tasks in a child process
//! - [`ChildRuntime`] - The child-process side of a [`ProcessWorker`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────── parent ─────────────┐        ┌──────────── child ─────────────┐
//! │ Worker                          │        │ ChildRuntime                   │
//! │  └─ ProcessWorker               │  JSON  │  └─ RpcChannel                 │
//! │      └─ RpcChannel ── stdin ────┼───────►│      └─ Worker                 │
//! │                   ◄── stdout ───┼────────┤          └─ your WorkerBehavior│
//! └─────────────────────────────────┘        └────────────────────────────────┘
//! ```

mod child;
mod instance;
mod kill;
mod process;

pub use child::ChildRuntime;
pub use instance::{DefaultBehavior, Worker, WorkerBehavior, WorkerEvent, WorkerStatus};
pub use kill::{KillMode, DEFAULT_KILL_SIGNAL};
pub use process::{
    KillCallback, ProcessWorker, ProcessWorkerOptions, DEFAULT_KILL_TIMEOUT, PROCESS_PROTOCOL_ID,
};
