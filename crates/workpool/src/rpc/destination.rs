//! Message destinations the RPC channel runs over

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::envelope::RpcEnvelope;
use crate::error::{PoolError, Result};

/// Lifecycle and message events raised by a destination
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationEvent {
    /// The far side is up (process spawned)
    Spawn,
    /// An inbound envelope
    Message(RpcEnvelope),
    /// The far side went away cleanly
    Close,
    /// The transport failed
    Error(String),
}

impl DestinationEvent {
    /// Event name as exposed to listeners
    pub fn name(&self) -> &'static str {
        match self {
            DestinationEvent::Spawn => "spawn",
            DestinationEvent::Message(_) => "message",
            DestinationEvent::Close => "close",
            DestinationEvent::Error(_) => "error",
        }
    }
}

/// Receiving half of a destination
pub type DestinationEvents = mpsc::UnboundedReceiver<DestinationEvent>;

/// Sending half of a bidirectional message destination
///
/// Implementations must not block: `send` queues the envelope and
/// returns. Inbound traffic and lifecycle changes arrive on the
/// [`DestinationEvents`] stream handed out alongside the destination.
pub trait RpcDestination: Send + Sync + 'static {
    /// Queue an envelope for delivery
    fn send(&self, envelope: RpcEnvelope) -> Result<()>;
}

/// In-process destination, one end of a duplex pair
///
/// # Example
///
/// ```
/// use workpool::rpc::MemoryDestination;
///
/// let ((left, left_events), (right, right_events)) = MemoryDestination::pair();
/// # drop((left, left_events, right, right_events));
/// ```
#[derive(Clone)]
pub struct MemoryDestination {
    peer: Arc<Mutex<Option<mpsc::UnboundedSender<DestinationEvent>>>>,
    own: Arc<Mutex<Option<mpsc::UnboundedSender<DestinationEvent>>>>,
}

impl std::fmt::Debug for MemoryDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDestination")
            .field("open", &self.peer.lock().is_some())
            .finish()
    }
}

impl MemoryDestination {
    /// Create two connected ends, each already marked as spawned
    pub fn pair() -> (
        (MemoryDestination, DestinationEvents),
        (MemoryDestination, DestinationEvents),
    ) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        let _ = left_tx.send(DestinationEvent::Spawn);
        let _ = right_tx.send(DestinationEvent::Spawn);

        let left_sink = Arc::new(Mutex::new(Some(left_tx)));
        let right_sink = Arc::new(Mutex::new(Some(right_tx)));

        let left = MemoryDestination {
            peer: right_sink.clone(),
            own: left_sink.clone(),
        };
        let right = MemoryDestination {
            peer: left_sink,
            own: right_sink,
        };
        ((left, left_rx), (right, right_rx))
    }

    /// Close both ends, raising `close` on each
    pub fn close(&self) {
        self.emit_both(DestinationEvent::Close);
    }

    /// Fail both ends, raising `error` on each
    pub fn fail(&self, reason: impl Into<String>) {
        self.emit_both(DestinationEvent::Error(reason.into()));
    }

    fn emit_both(&self, event: DestinationEvent) {
        for side in [&self.own, &self.peer] {
            if let Some(tx) = side.lock().take() {
                let _ = tx.send(event.clone());
            }
        }
    }
}

impl RpcDestination for MemoryDestination {
    fn send(&self, envelope: RpcEnvelope) -> Result<()> {
        match self.peer.lock().as_ref() {
            Some(tx) => tx
                .send(DestinationEvent::Message(envelope))
                .map_err(|_| PoolError::DestinationClosed),
            None => Err(PoolError::DestinationClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_delivers_to_peer() {
        let ((left, _left_rx), (_right, mut right_rx)) = MemoryDestination::pair();

        assert_eq!(right_rx.recv().await, Some(DestinationEvent::Spawn));

        let envelope = RpcEnvelope::request("p", "p:1".into(), json!(1));
        left.send(envelope.clone()).unwrap();
        assert_eq!(
            right_rx.recv().await,
            Some(DestinationEvent::Message(envelope))
        );
    }

    #[tokio::test]
    async fn test_close_reaches_both_sides_and_stops_sends() {
        let ((left, mut left_rx), (right, mut right_rx)) = MemoryDestination::pair();
        right.close();

        assert_eq!(left_rx.recv().await, Some(DestinationEvent::Spawn));
        assert_eq!(left_rx.recv().await, Some(DestinationEvent::Close));
        assert_eq!(right_rx.recv().await, Some(DestinationEvent::Spawn));
        assert_eq!(right_rx.recv().await, Some(DestinationEvent::Close));

        let err = left
            .send(RpcEnvelope::request("p", "p:1".into(), json!(null)))
            .unwrap_err();
        assert!(matches!(err, PoolError::DestinationClosed));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(DestinationEvent::Spawn.name(), "spawn");
        assert_eq!(DestinationEvent::Close.name(), "close");
        assert_eq!(DestinationEvent::Error("x".into()).name(), "error");
    }
}
