//! Child-process side of a process worker

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::instance::{Worker, WorkerBehavior};
use super::process::PROCESS_PROTOCOL_ID;
use crate::error::{PoolError, Result};
use crate::rpc::{ChannelLifecycle, DestinationEvents, RpcChannel, RpcDestination, RpcHandler, StdioDestination};

/// Serves a [`WorkerBehavior`] to a parent [`ProcessWorker`](super::ProcessWorker)
///
/// Call [`ChildRuntime::serve`] from the child's `main`. Stdout carries the
/// protocol, so anything the child logs must go to stderr.
///
/// ```no_run
/// use workpool::{ChildRuntime, WorkerBehavior};
///
/// struct MyWorker;
/// impl WorkerBehavior for MyWorker {}
///
/// #[tokio::main]
/// async fn main() -> workpool::Result<()> {
///     ChildRuntime::serve(MyWorker).await
/// }
/// ```
#[derive(Debug)]
pub struct ChildRuntime;

impl ChildRuntime {
    /// Serve over this process's stdin/stdout until the parent goes away
    pub async fn serve(behavior: impl WorkerBehavior) -> Result<()> {
        let (destination, events) = StdioDestination::from_process_stdio();
        Self::serve_on(behavior, Arc::new(destination), events).await
    }

    /// Serve over an arbitrary destination
    pub async fn serve_on(
        behavior: impl WorkerBehavior,
        destination: Arc<dyn RpcDestination>,
        events: DestinationEvents,
    ) -> Result<()> {
        let worker = Worker::new(format!("child-{}", std::process::id()), behavior);
        let channel = RpcChannel::open(
            PROCESS_PROTOCOL_ID,
            destination,
            events,
            Arc::new(ChildHandler { worker }),
        );
        info!("child worker serving");

        match channel.wait_for_close().await {
            ChannelLifecycle::Errored(reason) => Err(std::io::Error::other(reason).into()),
            _ => {
                info!("parent closed the channel");
                Ok(())
            }
        }
    }
}

struct ChildHandler {
    worker: Worker,
}

#[async_trait]
impl RpcHandler for ChildHandler {
    async fn handle(&self, payload: Value) -> Result<Value> {
        let action = payload.get("action").and_then(Value::as_str).unwrap_or_default();
        debug!(action, "request from parent");

        match action {
            "start" => {
                let attempts = payload
                    .get("attempts")
                    .and_then(Value::as_u64)
                    .map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX));
                // The outcome lands in the worker's own state.
                let _ = self.worker.start(attempts).await;
                if self.worker.is_free() {
                    return Ok(json!({ "success": true }));
                }
                Err(self
                    .worker
                    .error()
                    .unwrap_or_else(|| PoolError::UnexpectedResponse("unknown worker state".into())))
            }
            "executeTask" => {
                let content = payload.get("taskContent").cloned().unwrap_or(Value::Null);
                self.worker
                    .behavior()
                    .execute_task(&self.worker, &content)
                    .await
            }
            "getState" => Ok(self.worker.state_snapshot()),
            _ => self.worker.handle_message(payload).await,
        }
    }
}
