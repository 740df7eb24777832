//! Bounded-concurrency loop
//!
//! Drives a `for`-shaped iteration (initial state, condition, advance) with
//! at most `max_threads` statements in flight. Each statement runs through
//! [`Retry`] with the loop's attempt budget. A freed slot launches the next
//! tick immediately; there is no batching.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::retry::Retry;

/// Bounded-concurrency loop configuration
///
/// # Example
///
/// ```
/// use workpool::reliability::ParallelLoop;
///
/// # tokio_test::block_on(async {
/// let squares = ParallelLoop::new(2)
///     .map_array(vec![1u32, 2, 3], |n, _index, _all| async move { Ok::<_, ()>(n * n) })
///     .await
///     .unwrap();
/// assert_eq!(squares, vec![1, 4, 9]);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct ParallelLoop {
    max_threads: usize,
    attempts: u32,
}

impl Default for ParallelLoop {
    fn default() -> Self {
        Self {
            max_threads: 1,
            attempts: 1,
        }
    }
}

impl ParallelLoop {
    /// Create a loop with a concurrency limit
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads: max_threads.max(1),
            ..Default::default()
        }
    }

    /// Set the attempt budget for every statement
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Get the concurrency limit
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Run the loop
    ///
    /// Resolves once `condition` is false and every launched tick has
    /// finished. Fails with the first tick error that outlives its retries;
    /// ticks still in flight at that point keep running detached. A tick
    /// that panics is logged and counted as finished.
    pub async fn run<S, C, A, F, Fut, E>(
        &self,
        initial: S,
        mut condition: C,
        mut advance: A,
        statement: F,
    ) -> Result<(), E>
    where
        S: Clone + Send + 'static,
        C: FnMut(&S) -> bool,
        A: FnMut(S) -> S,
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let statement = Arc::new(statement);
        let retry = Retry::<E>::attempts(self.attempts);
        let mut in_flight: FuturesUnordered<JoinHandle<Result<(), E>>> = FuturesUnordered::new();
        let mut state = initial;
        let mut exhausted = false;

        loop {
            while !exhausted && in_flight.len() < self.max_threads {
                if !condition(&state) {
                    exhausted = true;
                    break;
                }

                let tick_state = state.clone();
                let statement = statement.clone();
                let retry = retry.clone();
                in_flight.push(tokio::spawn(async move {
                    retry.run(move || statement(tick_state.clone())).await
                }));

                state = advance(state);
            }

            match in_flight.next().await {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    debug!(remaining = in_flight.len(), "loop tick failed, detaching siblings");
                    return Err(err);
                }
                Some(Err(join_err)) if join_err.is_panic() => {
                    error!(remaining = in_flight.len(), "loop tick panicked, continuing with siblings");
                }
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "loop tick was cancelled");
                }
            }
        }

        Ok(())
    }

    /// Run a statement for every element of an array
    ///
    /// The statement receives `(element, index, array)`.
    pub async fn for_each_array<T, F, Fut, E>(&self, items: Vec<T>, statement: F) -> Result<(), E>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T, usize, Arc<Vec<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let items = Arc::new(items);
        let len = items.len();
        let all = items.clone();

        self.run(
            0usize,
            move |index| *index < len,
            |index| index + 1,
            move |index| statement(all[index].clone(), index, all.clone()),
        )
        .await
    }

    /// Run a statement for every element and collect index-aligned results
    pub async fn map_array<T, R, F, Fut, E>(&self, items: Vec<T>, statement: F) -> Result<Vec<R>, E>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T, usize, Arc<Vec<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Send + 'static,
    {
        let len = items.len();
        let slots: Arc<parking_lot::Mutex<Vec<Option<R>>>> =
            Arc::new(parking_lot::Mutex::new((0..len).map(|_| None).collect()));
        let sink = slots.clone();
        let statement = Arc::new(statement);

        self.for_each_array(items, move |item, index, all| {
            let sink = sink.clone();
            let fut = statement(item, index, all);
            async move {
                let value = fut.await?;
                sink.lock()[index] = Some(value);
                Ok(())
            }
        })
        .await?;

        let mut slots = slots.lock();
        Ok(slots.drain(..).flatten().collect())
    }
}
