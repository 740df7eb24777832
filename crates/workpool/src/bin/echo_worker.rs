//! Child-process worker used by the process worker tests
//!
//! - `{"index": n, ..}` is echoed back
//! - `{"maxTry": n, ..}` fails until the same content has been seen n times
//! - anything else throws its `error` field as a bare value
//!
//! `--fail-start=N` makes the first N start attempts in this process fail.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workpool::{ChildRuntime, PoolError, Worker, WorkerBehavior};

struct EchoWorker {
    start_failures: Mutex<u32>,
    tries_left: Mutex<HashMap<String, i64>>,
}

impl EchoWorker {
    fn new(start_failures: u32) -> Self {
        Self {
            start_failures: Mutex::new(start_failures),
            tries_left: Mutex::new(HashMap::new()),
        }
    }
}

async fn random_sleep() {
    let millis = rand::thread_rng().gen_range(5..=15);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[async_trait]
impl WorkerBehavior for EchoWorker {
    async fn start(&self, _worker: &Worker) -> workpool::Result<()> {
        random_sleep().await;
        let mut failures = self.start_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(PoolError::task("Init error test"));
        }
        Ok(())
    }

    async fn execute_task(&self, _worker: &Worker, content: &Value) -> workpool::Result<Value> {
        random_sleep().await;

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

        if content.get("index").is_some() {
            Ok(content.clone())
        } else {
            Err(PoolError::thrown(
                content.get("error").cloned().unwrap_or(Value::Null),
            ))
        }
    }
}

fn parse_fail_start() -> Result<u32> {
    for arg in std::env::args().skip(1) {
        if let Some(count) = arg.strip_prefix("--fail-start=") {
            return count
                .parse()
                .with_context(|| format!("invalid --fail-start value: {count}"));
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries the protocol.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workpool=info,echo_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let start_failures = parse_fail_start()?;
    tracing::info!(pid = std::process::id(), start_failures, "echo worker starting");

    ChildRuntime::serve(EchoWorker::new(start_failures)).await?;

    tracing::info!("echo worker exiting");
    Ok(())
}
