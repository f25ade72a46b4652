//! Transport binding capability.
//!
//! The channel engine depends only on these traits. A binding wraps an
//! asynchronous, completion-driven messaging library: operations are posted
//! and return immediately, and their completions are delivered through the
//! registered callbacks from inside [`Worker::progress`]. Bindings must not
//! invoke callbacks from any other call and must not hold internal locks while
//! a callback runs, since callbacks post new operations.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TransportFault};
use crate::tag::Tag;

/// Completed send as reported to the send callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCompletion {
    /// Tag of the message, `None` for stream sends.
    pub tag: Option<Tag>,
    /// Payload length in bytes.
    pub len: usize,
}

/// Completed receive as reported to the receive callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Sender's tag, `None` for stream receives.
    pub tag: Option<Tag>,
    /// Received payload.
    pub data: Bytes,
}

/// Outcome of a send, success or fault.
pub type SendOutcome = std::result::Result<SendCompletion, TransportFault>;
/// Outcome of a receive, success or fault.
pub type ReceiveOutcome = std::result::Result<Received, TransportFault>;

/// Invoked for every send posted with `use_callback`.
pub type SendCallback = Arc<dyn Fn(SendOutcome) + Send + Sync>;
/// Invoked for every receive posted with `use_callback`.
pub type ReceiveCallback = Arc<dyn Fn(ReceiveOutcome) + Send + Sync>;
/// Invoked when the endpoint fails (peer reset, unreachable peer).
pub type ErrorCallback = Arc<dyn Fn(TransportFault) + Send + Sync>;

/// An inbound connection request surfaced by a [`Listener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Binding-specific request handle.
    pub id: u64,
    /// Address the request came from.
    pub client_address: SocketAddr,
}

/// Progress engine and tagged receive queue. Each channel gets its own.
pub trait Worker: Send + Sync {
    /// Binding-unique worker id.
    fn id(&self) -> u64;

    /// Posts a receive for the next message whose tag matches `tag` under
    /// `tag_mask`. Messages longer than `capacity` complete with
    /// [`TransportFault::Truncated`].
    fn receive_tagged(&self, capacity: usize, tag: Tag, tag_mask: u64, use_callback: bool)
        -> Result<()>;

    /// Sets the callback for tagged and stream receive completions.
    fn set_receive_callback(&self, callback: ReceiveCallback);

    /// Drains the completion queue, running callbacks. Returns whether any
    /// completion was processed.
    fn progress(&self) -> Result<bool>;

    /// Parks the caller until an event may be pending. Bindings without a
    /// wait primitive yield instead.
    fn wait_for_event(&self) -> Result<()> {
        std::thread::yield_now();
        Ok(())
    }

    /// Releases the worker; queued completions are discarded.
    fn close(&self);
}

/// One side of a connection.
pub trait Endpoint: Send + Sync {
    /// Sends `data` as a single tagged message.
    fn send_tagged(&self, data: Bytes, tag: Tag, use_callback: bool) -> Result<()>;

    /// Appends `data` to the byte stream.
    fn send_stream(&self, data: Bytes, use_callback: bool) -> Result<()>;

    /// Posts a receive of up to `capacity` stream bytes.
    fn receive_stream(&self, capacity: usize, use_callback: bool) -> Result<()>;

    /// Sets the callback for send completions.
    fn set_send_callback(&self, callback: SendCallback);

    /// Sets the callback for endpoint failures.
    fn set_error_callback(&self, callback: ErrorCallback);

    /// Address of the remote side, if known.
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Releases the endpoint. The peer observes a connection reset.
    fn close(&self);
}

/// Accepts inbound connection requests on a local address.
pub trait Listener: Send + Sync {
    /// Address the listener is bound to.
    fn local_address(&self) -> SocketAddr;

    /// Pops the oldest pending request, if any.
    fn poll_request(&self) -> Option<ConnectionRequest>;

    /// Number of pending requests.
    fn pending(&self) -> usize;

    /// Stops listening; pending requests are refused.
    fn close(&self);
}

/// Factory for workers, endpoints and listeners. Chosen once at startup.
pub trait TransportBinding: Send + Sync {
    /// Human-readable binding name for logs.
    fn name(&self) -> &str;

    /// Creates a fresh worker.
    fn create_worker(&self) -> Result<Arc<dyn Worker>>;

    /// Creates an endpoint on `worker` connecting to `remote`. Returns before
    /// the peer has accepted.
    fn connect(&self, worker: &dyn Worker, remote: SocketAddr) -> Result<Arc<dyn Endpoint>>;

    /// Creates an endpoint on `worker` answering `request`.
    fn accept(&self, worker: &dyn Worker, request: ConnectionRequest) -> Result<Arc<dyn Endpoint>>;

    /// Starts listening on `local` with at most `backlog` pending requests.
    fn listen(&self, local: SocketAddr, backlog: usize) -> Result<Arc<dyn Listener>>;
}
