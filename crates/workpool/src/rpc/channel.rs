//! Request/reply channel over a message destination

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use super::destination::{DestinationEvent, DestinationEvents, RpcDestination};
use super::envelope::{CorrelationSequence, RpcBody, RpcEnvelope, RpcOutcome};
use crate::error::{PoolError, Result};

/// Answers requests arriving on a channel
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one request payload
    async fn handle(&self, payload: Value) -> Result<Value>;
}

/// Handler that answers every request with `null`
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl RpcHandler for NoopHandler {
    async fn handle(&self, _payload: Value) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> Result<Value> {
        (self.0)(payload).await
    }
}

/// Destination lifecycle as seen by the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLifecycle {
    /// Waiting for the destination to come up
    Pending,
    /// Destination confirmed it is up
    Spawned,
    /// Destination closed; the channel is tombstoned
    Closed,
    /// Destination failed; the channel is tombstoned
    Errored(String),
}

impl ChannelLifecycle {
    fn is_terminal(&self) -> bool {
        matches!(self, ChannelLifecycle::Closed | ChannelLifecycle::Errored(_))
    }
}

/// Lifecycle events a caller can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Spawn,
    Close,
}

type PendingReply = oneshot::Sender<Result<RpcOutcome>>;

struct ChannelState {
    pending: HashMap<String, PendingReply>,
    sequence: CorrelationSequence,
    closed: bool,
}

struct ChannelInner {
    protocol_id: String,
    destination: Arc<dyn RpcDestination>,
    handler: Arc<dyn RpcHandler>,
    state: Mutex<ChannelState>,
    lifecycle: watch::Sender<ChannelLifecycle>,
}

/// Symmetric request/reply channel
///
/// Both ends of a destination run a channel with the same protocol id.
/// Either side may issue requests; each side answers the other's requests
/// through its installed [`RpcHandler`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use workpool::rpc::{handler_fn, MemoryDestination, NoopHandler, RpcChannel};
///
/// # tokio_test::block_on(async {
/// let ((left, left_events), (right, right_events)) = MemoryDestination::pair();
/// let client = RpcChannel::open("demo", Arc::new(left), left_events, Arc::new(NoopHandler));
/// let _server = RpcChannel::open(
///     "demo",
///     Arc::new(right),
///     right_events,
///     Arc::new(handler_fn(|payload| async move { Ok(json!({ "echo": payload })) })),
/// );
///
/// let reply = client.request(json!(7), None).await.unwrap();
/// assert_eq!(reply, json!({ "echo": 7 }));
/// # });
/// ```
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("protocol_id", &self.inner.protocol_id)
            .field("lifecycle", &*self.inner.lifecycle.borrow())
            .finish()
    }
}

impl RpcChannel {
    /// Open a channel over a destination
    pub fn open(
        protocol_id: impl Into<String>,
        destination: Arc<dyn RpcDestination>,
        events: DestinationEvents,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        Self::open_with_sequence(
            protocol_id,
            destination,
            events,
            handler,
            CorrelationSequence::default(),
        )
    }

    /// Open a channel with an explicit correlation sequence
    pub fn open_with_sequence(
        protocol_id: impl Into<String>,
        destination: Arc<dyn RpcDestination>,
        events: DestinationEvents,
        handler: Arc<dyn RpcHandler>,
        sequence: CorrelationSequence,
    ) -> Self {
        let (lifecycle, _) = watch::channel(ChannelLifecycle::Pending);
        let inner = Arc::new(ChannelInner {
            protocol_id: protocol_id.into(),
            destination,
            handler,
            state: Mutex::new(ChannelState {
                pending: HashMap::new(),
                sequence,
                closed: false,
            }),
            lifecycle,
        });

        let dispatcher = tokio::spawn(dispatch(inner.clone(), events));
        Self { inner, dispatcher }
    }

    /// Protocol id this channel answers to
    pub fn protocol_id(&self) -> &str {
        &self.inner.protocol_id
    }

    /// Current destination lifecycle
    pub fn lifecycle(&self) -> ChannelLifecycle {
        self.inner.lifecycle.borrow().clone()
    }

    /// Whether the channel has been tombstoned
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Send a request and wait for its reply
    ///
    /// With a timeout, whichever of reply and timer finishes first wins;
    /// the loser's bookkeeping is removed so a late reply is dropped.
    #[instrument(skip(self, payload), fields(protocol_id = %self.inner.protocol_id))]
    pub async fn request(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let (tx, mut rx) = oneshot::channel();

        let correlation_id = {
            let mut guard = self.inner.state.lock();
            if guard.closed {
                return Err(PoolError::DestinationClosed);
            }
            let ChannelState {
                pending, sequence, ..
            } = &mut *guard;
            let id = sequence
                .next_id(&self.inner.protocol_id, |id| pending.contains_key(id))
                .ok_or(PoolError::CorrelationExhausted)?;
            pending.insert(id.clone(), tx);
            id
        };
        trace!(%correlation_id, "sending request");

        let envelope = RpcEnvelope::request(&self.inner.protocol_id, correlation_id.clone(), payload);
        if let Err(err) = self.inner.destination.send(envelope) {
            self.inner.state.lock().pending.remove(&correlation_id);
            return Err(err);
        }

        let reply = match timeout {
            None => rx.await,
            Some(limit) => {
                tokio::select! {
                    reply = &mut rx => reply,
                    _ = tokio::time::sleep(limit) => {
                        let timed_out = {
                            let mut state = self.inner.state.lock();
                            let removed = state.pending.remove(&correlation_id).is_some();
                            if removed {
                                state.sequence.abandon(correlation_id.clone());
                            }
                            removed
                        };
                        if timed_out {
                            debug!(%correlation_id, ?limit, "request timed out");
                            return Err(PoolError::RpcTimeout(limit));
                        }
                        // The reply won the race while the timer fired.
                        rx.await
                    }
                }
            }
        };

        match reply {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PoolError::DestinationClosed),
        }
    }

    /// Wait until the destination confirms it is up
    pub async fn wait_spawn(&self) -> Result<()> {
        let mut rx = self.inner.lifecycle.subscribe();
        let state = rx
            .wait_for(|state| *state != ChannelLifecycle::Pending)
            .await
            .map(|state| (*state).clone())
            .map_err(|_| PoolError::DestinationClosed)?;

        match state {
            ChannelLifecycle::Errored(reason) => Err(PoolError::from(std::io::Error::other(reason))),
            ChannelLifecycle::Closed => Err(PoolError::DestinationClosed),
            _ => Ok(()),
        }
    }

    /// Wait until the destination is closed or failed
    pub async fn wait_for_close(&self) -> ChannelLifecycle {
        let mut rx = self.inner.lifecycle.subscribe();
        let state = match rx.wait_for(ChannelLifecycle::is_terminal).await {
            Ok(state) => (*state).clone(),
            Err(_) => ChannelLifecycle::Closed,
        };
        state
    }

    /// Wait for a named lifecycle event
    pub async fn wait_for_event(&self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Spawn => self.wait_spawn().await,
            LifecycleEvent::Close => {
                self.wait_for_close().await;
                Ok(())
            }
        }
    }

    /// Tombstone the channel locally, rejecting pending requests
    pub fn destroy(&self) {
        tombstone(&self.inner, ChannelLifecycle::Closed);
        self.dispatcher.abort();
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(inner: Arc<ChannelInner>, mut events: DestinationEvents) {
    loop {
        let event = match events.recv().await {
            Some(event) => event,
            None => DestinationEvent::Close,
        };

        match event {
            DestinationEvent::Spawn => {
                inner.lifecycle.send_if_modified(|state| {
                    if *state == ChannelLifecycle::Pending {
                        *state = ChannelLifecycle::Spawned;
                        true
                    } else {
                        false
                    }
                });
            }
            DestinationEvent::Message(envelope) => on_message(&inner, envelope),
            DestinationEvent::Close => {
                tombstone(&inner, ChannelLifecycle::Closed);
                break;
            }
            DestinationEvent::Error(reason) => {
                warn!(protocol_id = %inner.protocol_id, %reason, "destination error");
                tombstone(&inner, ChannelLifecycle::Errored(reason));
                break;
            }
        }
    }
    trace!(protocol_id = %inner.protocol_id, "dispatcher exited");
}

fn on_message(inner: &Arc<ChannelInner>, envelope: RpcEnvelope) {
    if envelope.protocol_id != inner.protocol_id {
        trace!(foreign = %envelope.protocol_id, "ignoring message for another protocol");
        return;
    }

    match envelope.body {
        RpcBody::Request { payload } => {
            let inner = inner.clone();
            let correlation_id = envelope.correlation_id;
            tokio::spawn(async move {
                let handler = inner.handler.clone();
                let result = match tokio::spawn(async move { handler.handle(payload).await }).await {
                    Ok(result) => result,
                    Err(join_err) => Err(PoolError::task(format!("rpc handler failed: {}", join_err))),
                };

                if inner.state.lock().closed {
                    return;
                }
                let response = RpcEnvelope::response(
                    &inner.protocol_id,
                    correlation_id,
                    RpcOutcome::from_result(result),
                );
                if let Err(err) = inner.destination.send(response) {
                    debug!(error = %err, "could not send response");
                }
            });
        }
        RpcBody::Response { payload } => {
            let mut state = inner.state.lock();
            match state.pending.remove(&envelope.correlation_id) {
                Some(reply) => {
                    let _ = reply.send(Ok(payload));
                }
                None if state.sequence.take_abandoned(&envelope.correlation_id) => {
                    debug!(correlation_id = %envelope.correlation_id, "dropping late response");
                }
                None => {
                    trace!(correlation_id = %envelope.correlation_id, "response for unknown request");
                }
            }
        }
    }
}

fn tombstone(inner: &ChannelInner, terminal: ChannelLifecycle) {
    let pending = {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        std::mem::take(&mut state.pending)
    };

    if !pending.is_empty() {
        debug!(count = pending.len(), "rejecting pending requests");
    }
    for (_, reply) in pending {
        let _ = reply.send(Err(PoolError::DestinationClosed));
    }
    inner.lifecycle.send_replace(terminal);
}
