//! Scheduling: tasks, the pool manager and its distribution policy
//!
//! This module provides:
//! - [`PoolManager`] - Owns workers and tasks, pairs them up
//! - [`Task`] - One unit of submitted work and its result
//! - [`PoolConfig`] - Manager options and hooks
//! - [`default_distribution`] - Pinned-first, then positional pairing

mod config;
mod distribute;
pub(crate) mod manager;
mod task;

pub use config::{Distributor, InitErrorHook, PoolConfig};
pub use distribute::{default_distribution, Pairing};
pub use manager::{PoolEvent, PoolManager};
pub use task::{Task, TaskEvent, TaskOptions, TaskResult, TaskState};
