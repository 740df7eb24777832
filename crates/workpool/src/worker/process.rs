//! Worker backed by a child process
//!
//! The child runs [`ChildRuntime`](super::ChildRuntime) and talks to the
//! parent over newline-delimited JSON on its stdin/stdout. `start` spawns
//! the child and asks it to start its own worker; `execute_task` forwards
//! the task content. Killing always reports through the configured
//! callback and never fails the caller.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::instance::{Worker, WorkerBehavior};
use super::kill::{KillMode, DEFAULT_KILL_SIGNAL};
use crate::error::{PoolError, Result};
use crate::rpc::{NoopHandler, RpcChannel, StdioDestination};

/// Protocol id shared by the parent and child sides
pub const PROCESS_PROTOCOL_ID: &str = "workpool.process";

/// How long a kill waits for the child to exit unless configured otherwise
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives the outcome of every kill
pub type KillCallback = Arc<dyn Fn(Option<PoolError>) + Send + Sync>;

/// Process worker configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use workpool::{KillMode, ProcessWorkerOptions};
///
/// let options = ProcessWorkerOptions::new("/usr/local/bin/my-worker")
///     .with_args(["--verbose"])
///     .with_env("RUST_LOG", "debug")
///     .with_start_timeout(Duration::from_secs(10))
///     .with_kill_mode(KillMode::TreeKill);
/// assert_eq!(options.args, vec!["--verbose".to_string()]);
/// ```
#[derive(Clone)]
pub struct ProcessWorkerOptions {
    /// Executable to spawn
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
    /// Let the child write to our stderr
    pub inherit_stderr: bool,
    /// Bound on the `start` request
    pub start_timeout: Option<Duration>,
    /// Attempts the child's worker gets inside one `start` request
    pub start_attempts: u32,
    /// Bound on each `executeTask` request
    pub execute_task_timeout: Option<Duration>,
    pub kill_mode: KillMode,
    /// Signal number; SIGKILL when unset
    pub kill_signal: Option<i32>,
    /// How long a kill waits for the child to exit
    pub kill_timeout: Duration,
    /// Skip the final liveness check after a kill
    pub skip_killed_check: bool,
    pub kill_callback: KillCallback,
}

impl std::fmt::Debug for ProcessWorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorkerOptions")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("current_dir", &self.current_dir)
            .field("start_timeout", &self.start_timeout)
            .field("start_attempts", &self.start_attempts)
            .field("execute_task_timeout", &self.execute_task_timeout)
            .field("kill_mode", &self.kill_mode)
            .field("kill_signal", &self.kill_signal)
            .field("kill_timeout", &self.kill_timeout)
            .field("skip_killed_check", &self.skip_killed_check)
            .finish_non_exhaustive()
    }
}

impl ProcessWorkerOptions {
    /// Options for a program with default settings
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            inherit_stderr: true,
            start_timeout: None,
            start_attempts: 1,
            execute_task_timeout: None,
            kill_mode: KillMode::default(),
            kill_signal: None,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            skip_killed_check: false,
            kill_callback: Arc::new(|outcome| {
                if let Some(err) = outcome {
                    warn!(error = %err, "process kill failed");
                }
            }),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_inherit_stderr(mut self, inherit: bool) -> Self {
        self.inherit_stderr = inherit;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    pub fn with_start_attempts(mut self, attempts: u32) -> Self {
        self.start_attempts = attempts.max(1);
        self
    }

    pub fn with_execute_task_timeout(mut self, timeout: Duration) -> Self {
        self.execute_task_timeout = Some(timeout);
        self
    }

    pub fn with_kill_mode(mut self, mode: KillMode) -> Self {
        self.kill_mode = mode;
        self
    }

    pub fn with_kill_signal(mut self, signal: i32) -> Self {
        self.kill_signal = Some(signal);
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_skip_killed_check(mut self, skip: bool) -> Self {
        self.skip_killed_check = skip;
        self
    }

    pub fn with_kill_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<PoolError>) + Send + Sync + 'static,
    {
        self.kill_callback = Arc::new(callback);
        self
    }
}

struct RunningChild {
    child: Child,
    pid: Option<u32>,
    channel: Arc<RpcChannel>,
    destination: StdioDestination,
}

/// [`WorkerBehavior`] that runs tasks in a child process
pub struct ProcessWorker {
    options: ProcessWorkerOptions,
    running: Mutex<Option<RunningChild>>,
}

impl std::fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ProcessWorker {
    pub fn new(options: ProcessWorkerOptions) -> Self {
        Self {
            options,
            running: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ProcessWorkerOptions {
        &self.options
    }

    /// Pid of the current child, if one is running
    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().and_then(|running| running.pid)
    }

    /// Send a free-form request to the child's worker
    pub async fn request(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let channel = self.channel().await?;
        channel.request(payload, timeout).await
    }

    async fn channel(&self) -> Result<Arc<RpcChannel>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.channel.clone())
            .ok_or(PoolError::DestinationClosed)
    }

    fn spawn(&self) -> Result<RunningChild> {
        let mut command = Command::new(&self.options.program);
        command
            .args(&self.options.args)
            .envs(self.options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if self.options.inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &self.options.current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::UnexpectedResponse("child stdin is not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::UnexpectedResponse("child stdout is not piped".into()))?;

        let (destination, events) = StdioDestination::new(stdout, stdin);
        let channel = RpcChannel::open(
            PROCESS_PROTOCOL_ID,
            Arc::new(destination.clone()),
            events,
            Arc::new(NoopHandler),
        );

        Ok(RunningChild {
            child,
            pid,
            channel: Arc::new(channel),
            destination,
        })
    }

    /// Terminate a child and report what went wrong, if anything
    async fn terminate(&self, running: RunningChild) -> Option<PoolError> {
        let RunningChild {
            mut child,
            pid,
            channel,
            destination,
        } = running;
        let signal = self.options.kill_signal.unwrap_or(DEFAULT_KILL_SIGNAL);

        let mut signaled = false;
        let mut error = match self.options.kill_mode {
            KillMode::Kill => self.kill_direct(&mut child, pid, signal, &mut signaled).await,
            KillMode::TreeKill => {
                let tree = kill_tree(pid, signal, &mut signaled);
                if matches!(child.try_wait(), Ok(None)) {
                    debug!(?pid, "process survived tree kill, signaling directly");
                    self.kill_direct(&mut child, pid, signal, &mut signaled).await
                } else {
                    tree
                }
            }
        };

        if !self.options.skip_killed_check && !signaled && matches!(child.try_wait(), Ok(None)) {
            error = Some(PoolError::ProcessStillAlive {
                pid: pid.unwrap_or_default(),
            });
        }

        destination.shutdown();
        channel.destroy();
        // Reap in the background so the child never lingers as a zombie.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        error
    }

    async fn kill_direct(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        signal: i32,
        signaled: &mut bool,
    ) -> Option<PoolError> {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(?pid, %status, "process already exited");
                return None;
            }
            Ok(None) => {}
            Err(err) => return Some(err.into()),
        }

        let delivered = match pid {
            #[cfg(unix)]
            Some(pid) => super::kill::signal_process(pid, signal),
            #[cfg(not(unix))]
            Some(_) => child.start_kill().map(|()| true),
            None => Ok(false),
        };
        match delivered {
            Ok(true) => *signaled = true,
            Ok(false) => {
                debug!(?pid, "process was gone before the signal");
                return None;
            }
            Err(err) => return Some(err.into()),
        }

        match tokio::time::timeout(self.options.kill_timeout, child.wait()).await {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(err.into()),
            Err(_) if self.options.skip_killed_check => None,
            Err(_) => {
                warn!(?pid, signal, timeout = ?self.options.kill_timeout, "process did not exit after kill");
                Some(PoolError::ProcessStillAlive {
                    pid: pid.unwrap_or_default(),
                })
            }
        }
    }
}

/// Signal the child's process group
///
/// The child is spawned as a group leader, so its descendants share the
/// group unless they detach with `setsid`; detached descendants escape.
#[cfg(unix)]
fn kill_tree(pid: Option<u32>, signal: i32, signaled: &mut bool) -> Option<PoolError> {
    let pid = pid?;
    match super::kill::signal_group(pid, signal) {
        Ok(delivered) => {
            *signaled |= delivered;
            None
        }
        Err(err) => Some(err.into()),
    }
}

/// Without process groups the direct fallback does the work.
#[cfg(not(unix))]
fn kill_tree(_pid: Option<u32>, _signal: i32, _signaled: &mut bool) -> Option<PoolError> {
    None
}

#[async_trait]
impl WorkerBehavior for ProcessWorker {
    #[instrument(skip(self, worker), fields(worker = %worker.name()))]
    async fn start(&self, worker: &Worker) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            if let Some(err) = self.terminate(previous).await {
                debug!(error = %err, "previous process did not close cleanly");
            }
        }

        let child = self.spawn()?;
        let channel = child.channel.clone();
        let pid = child.pid;
        *running = Some(child);
        drop(running);

        channel.wait_spawn().await?;
        let start = json!({ "action": "start", "attempts": self.options.start_attempts });
        channel.request(start, self.options.start_timeout).await?;
        info!(?pid, "process worker started");
        Ok(())
    }

    async fn execute_task(&self, _worker: &Worker, content: &Value) -> Result<Value> {
        let channel = self.channel().await?;
        channel
            .request(
                json!({ "action": "executeTask", "taskContent": content }),
                self.options.execute_task_timeout,
            )
            .await
    }

    async fn kill(&self, worker: &Worker) -> Result<()> {
        let running = self.running.lock().await.take();
        let outcome = match running {
            Some(running) => self.terminate(running).await,
            None => None,
        };
        debug!(worker = %worker.name(), failed = outcome.is_some(), "process worker killed");
        (self.options.kill_callback)(outcome);
        Ok(())
    }

    async fn handle_message(&self, _worker: &Worker, message: Value) -> Result<Value> {
        self.request(message, self.options.execute_task_timeout).await
    }

    async fn restart(&self, worker: &Worker) -> Result<()> {
        worker.start(1).await
    }
}
