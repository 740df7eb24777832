//! Request/reply RPC over message destinations
//!
//! - [`RpcEnvelope`] - the wire message
//! - [`RpcDestination`] - anything envelopes can be sent through
//! - [`RpcChannel`] - correlates requests with replies, with optional timeouts

mod channel;
mod destination;
mod envelope;
mod stdio;

pub use channel::{
    handler_fn, ChannelLifecycle, FnHandler, LifecycleEvent, NoopHandler, RpcChannel, RpcHandler,
};
pub use destination::{DestinationEvent, DestinationEvents, MemoryDestination, RpcDestination};
pub use envelope::{
    CorrelationSequence, RpcBody, RpcEnvelope, RpcOutcome, DEFAULT_CORRELATION_WRAP,
};
pub use stdio::StdioDestination;
