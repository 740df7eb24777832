//! Retry policy and retry executor

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// How many times to try and how long to wait in between
///
/// Same-worker task retries wait [`RetryPolicy::interval`] between attempts;
/// worker start-up retries back to back.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use workpool::RetryPolicy;
///
/// // Three attempts, 50ms apart
/// let policy = RetryPolicy::fixed(Duration::from_millis(50), 3);
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempt budget, first call included
    pub max_attempts: u32,

    /// Wait before every retry
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(3)
    }
}

impl RetryPolicy {
    /// Retry back to back
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(Duration::ZERO, max_attempts)
    }

    /// Same wait before every retry
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// A single attempt
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wait before `attempt` (1-based); the first attempt never waits
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        self.interval
    }

    /// Whether another attempt fits in the budget after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Decides whether to retry after a failed attempt (1-based)
pub type RetryStrategy<E> = Arc<dyn Fn(u32, &E) -> bool + Send + Sync>;

/// Observes every failed attempt before the strategy is consulted
pub type OnRetryError<E> = Arc<dyn Fn(&E) -> BoxFuture<'static, ()> + Send + Sync>;

/// Retry executor
///
/// Calls an operation until it succeeds or the strategy says stop, then
/// returns the last error. Without a custom strategy the policy's attempt
/// budget decides.
///
/// # Example
///
/// ```
/// use workpool::reliability::{Retry, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let mut calls = 0;
/// let result: Result<u32, &str> = Retry::new(RetryPolicy::immediate(3))
///     .run(|| {
///         calls += 1;
///         let attempt = calls;
///         async move { if attempt < 3 { Err("not yet") } else { Ok(attempt) } }
///     })
///     .await;
/// assert_eq!(result, Ok(3));
/// # });
/// ```
pub struct Retry<E> {
    policy: RetryPolicy,
    strategy: Option<RetryStrategy<E>>,
    on_error: Option<OnRetryError<E>>,
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            strategy: self.strategy.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<E> Retry<E> {
    /// Create a retry executor for a policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            strategy: None,
            on_error: None,
        }
    }

    /// Create an immediate retry executor with an attempt budget
    pub fn attempts(max_attempts: u32) -> Self {
        Self::new(RetryPolicy::immediate(max_attempts))
    }

    /// Replace the attempt check with a custom strategy
    pub fn with_strategy<F>(mut self, strategy: F) -> Self
    where
        F: Fn(u32, &E) -> bool + Send + Sync + 'static,
    {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Await a hook on every failed attempt
    pub fn with_on_error<F, Fut>(mut self, on_error: F) -> Self
    where
        F: Fn(&E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err| Box::pin(on_error(err))));
        self
    }

    /// Get the policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run an operation until it succeeds or retries are exhausted
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if let Some(on_error) = &self.on_error {
                on_error(&error).await;
            }

            let again = match &self.strategy {
                Some(strategy) => strategy(attempt, &error),
                None => self.policy.has_attempts_remaining(attempt),
            };
            if !again {
                trace!(attempt, "retries exhausted");
                return Err(error);
            }

            attempt += 1;
            let delay = self.policy.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after error");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run an operation with an immediate attempt budget
pub async fn retry<T, E, F, Fut>(max_attempts: u32, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    Retry::attempts(max_attempts).run(operation).await
}

/// `Duration` as whole milliseconds
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as whole milliseconds or null
pub(crate) mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
