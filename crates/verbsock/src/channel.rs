//! Socket channel engine.
//!
//! A [`SocketChannel`] turns a tagged-message transport into an ordered byte
//! stream that can be driven either blockingly or through readiness polling.
//!
//! Each channel owns a worker, a send ring and a receive ring. Outbound bytes
//! are copied into the send ring and shipped as DATA messages of at most `M`
//! bytes that never straddle the ring's physical end; a ring slot is reclaimed
//! when its send completes. Inbound DATA messages land in the receive ring in
//! completion order. Flow control follows [`crate::flow`]: the receiver
//! acknowledges every `K` messages with an empty FLUSH, and a sender with `K`
//! unacknowledged messages stops until that FLUSH arrives.
//!
//! Completions only run inside the worker's progress function, which is driven
//! by [`SocketChannel::ready_ops`], [`SocketChannel::select`] and the blocking
//! loops. Callbacks hold a weak reference to the channel core and do nothing
//! once the channel is closed.
//!
//! # Lock order
//!
//! `send_ring` before `flow`. No other lock is held while taking a second one,
//! and no channel lock is held while the worker progresses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::binding::{ConnectionRequest, Endpoint, ReceiveOutcome, SendOutcome, TransportBinding, Worker};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result, TransportFault};
use crate::flow::{FlowControl, FlowControlState};
use crate::handshake::{self, Handshake, HandshakeStatus, CONNECTION_MAGIC, HANDSHAKE_LEN};
use crate::metrics::{ChannelMetrics, MetricsSnapshot};
use crate::ring::RingBuffer;
use crate::selector::{ReadyOps, Selectable};
use crate::tag::{self, ConnectionId, MessageKind, Tag, TAG_MASK_FULL};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    /// Opened, no connection attempted.
    Idle,
    /// Endpoint created, handshake outstanding.
    Handshaking,
    /// Handshake confirmed in both directions.
    Connected,
    /// Closed by the user or by a transport fault.
    Closed,
}

/// Result of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied out; 0 means nothing was buffered.
    Read(usize),
    /// The stream ended: input was shut down or the connection failed.
    EndOfStream,
}

impl ReadOutcome {
    /// Bytes read, 0 at end of stream.
    pub fn bytes(self) -> usize {
        match self {
            ReadOutcome::Read(n) => n,
            ReadOutcome::EndOfStream => 0,
        }
    }

    /// Whether this is [`ReadOutcome::EndOfStream`].
    pub fn is_end_of_stream(self) -> bool {
        self == ReadOutcome::EndOfStream
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn closed_error(fault: Option<TransportFault>) -> ChannelError {
    fault.map(ChannelError::Transport).unwrap_or(ChannelError::ChannelClosed)
}

struct Status {
    state: ChannelState,
    handshake: Handshake,
    remote: Option<SocketAddr>,
    input_shut: bool,
    output_shut: bool,
    fault: Option<TransportFault>,
    /// Magic of the last rejected handshake, reported by `finish_connect`
    /// until the next connect.
    rejected: Option<u64>,
    /// Bumped per endpoint so completions from a discarded attempt are ignored.
    attempt: u64,
    /// Whether the caller has observed the connection via `finish_connect`.
    /// Accepted channels start out finished.
    connect_finished: bool,
}

impl Status {
    /// CONNECT readiness: a connect is outstanding or completed but unfinished.
    fn connect_outstanding(&self) -> bool {
        match self.state {
            ChannelState::Handshaking => self.handshake.status() == HandshakeStatus::Pending,
            ChannelState::Connected => !self.connect_finished,
            ChannelState::Idle | ChannelState::Closed => false,
        }
    }
}

/// State shared between the channel handle and its transport callbacks.
struct Core {
    local_id: ConnectionId,
    peer_id: OnceLock<ConnectionId>,
    max_message_size: usize,
    worker: Arc<dyn Worker>,
    endpoint: Mutex<Option<Arc<dyn Endpoint>>>,
    live: AtomicBool,
    blocking: AtomicBool,
    receive_parked: AtomicBool,
    status: Mutex<Status>,
    send_ring: Mutex<Option<RingBuffer>>,
    recv_ring: Mutex<Option<RingBuffer>>,
    flow: Mutex<FlowControl>,
    metrics: ChannelMetrics,
}

impl Core {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        lock(&self.endpoint).clone()
    }

    /// Runs one progress pass, parking on the worker if it found nothing.
    fn park(&self) -> Result<()> {
        if !self.worker.progress()? {
            self.worker.wait_for_event()?;
        }
        Ok(())
    }

    fn post_data_receive(&self) -> Result<()> {
        self.worker.receive_tagged(
            self.max_message_size,
            Tag::new(MessageKind::Data, self.local_id),
            TAG_MASK_FULL,
            true,
        )
    }

    fn post_flush_receive(&self) -> Result<()> {
        self.worker
            .receive_tagged(0, Tag::new(MessageKind::Flush, self.local_id), TAG_MASK_FULL, true)
    }

    fn on_receive(&self, outcome: ReceiveOutcome) {
        if !self.is_live() {
            trace!(id = %self.local_id, "dropping receive completion on closed channel");
            return;
        }
        let received = match outcome {
            Ok(received) => received,
            Err(fault) => return self.fail(fault),
        };
        let Some(tag) = received.tag else {
            warn!(id = %self.local_id, len = received.data.len(), "ignoring untagged receive");
            return;
        };
        match tag.kind() {
            Ok(MessageKind::Handshake) => {
                let progress = lock(&self.status).handshake.on_received(&received.data);
                match progress {
                    HandshakeStatus::Complete(peer) => self.on_handshake_complete(peer),
                    HandshakeStatus::Rejected { got } => self.on_handshake_rejected(got),
                    HandshakeStatus::Pending => {}
                }
            }
            Ok(MessageKind::Data) => self.on_data(&received.data),
            Ok(MessageKind::Flush) => self.on_flush(),
            Err(e) => warn!(id = %self.local_id, %tag, error = %e, "dropping message"),
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        lock(&self.status).attempt == attempt
    }

    fn on_send(&self, attempt: u64, outcome: SendOutcome) {
        if !self.is_live() || !self.is_current(attempt) {
            return;
        }
        let completion = match outcome {
            Ok(completion) => completion,
            Err(fault) => return self.fail(fault),
        };
        match completion.tag.map(Tag::kind) {
            Some(Ok(MessageKind::Handshake)) => {
                let progress = lock(&self.status).handshake.on_sent();
                if let HandshakeStatus::Complete(peer) = progress {
                    self.on_handshake_complete(peer);
                }
            }
            Some(Ok(MessageKind::Data)) => {
                if let Some(ring) = lock(&self.send_ring).as_mut() {
                    if let Err(e) = ring.advance_read(completion.len) {
                        error!(id = %self.local_id, error = %e, "send completion out of step with ring");
                    }
                }
            }
            _ => trace!(id = %self.local_id, ?completion, "ignoring send completion"),
        }
    }

    fn on_handshake_complete(&self, peer: ConnectionId) {
        {
            let mut status = lock(&self.status);
            if status.state != ChannelState::Handshaking {
                return;
            }
            let _ = self.peer_id.set(peer);
            status.state = ChannelState::Connected;
        }
        info!(id = %self.local_id, %peer, "connection established");
        if let Err(e) = self.post_flush_receive().and_then(|_| self.post_data_receive()) {
            error!(id = %self.local_id, error = %e, "failed to post receives");
            self.fail(TransportFault::EndpointClosed);
        }
    }

    /// Drops the endpoint of a rejected attempt and returns to `Idle`.
    fn on_handshake_rejected(&self, got: u64) {
        {
            let mut status = lock(&self.status);
            if status.state != ChannelState::Handshaking {
                return;
            }
            status.state = ChannelState::Idle;
            status.handshake = Handshake::new();
            status.rejected = Some(got);
            status.remote = None;
            status.attempt += 1;
        }
        error!(
            id = %self.local_id,
            expected = format_args!("0x{CONNECTION_MAGIC:016X}"),
            got = format_args!("0x{got:016X}"),
            "handshake rejected, discarding connection attempt"
        );
        let endpoint = lock(&self.endpoint).take();
        if let Some(endpoint) = endpoint {
            endpoint.close();
        }
    }

    fn on_data(&self, data: &[u8]) {
        let free = {
            let mut guard = lock(&self.recv_ring);
            let Some(ring) = guard.as_mut() else {
                return;
            };
            let free = ring.free();
            if data.len() > free {
                drop(guard);
                error!(id = %self.local_id, len = data.len(), free, "peer overran the receive ring");
                return self.fail(TransportFault::Truncated {
                    len: data.len(),
                    capacity: free,
                });
            }
            ring.write(data);
            ring.free()
        };
        self.metrics.inc_messages_received();
        trace!(id = %self.local_id, len = data.len(), "data received");

        if lock(&self.flow).record_receive() {
            self.send_flush();
        }

        if free >= self.max_message_size {
            if let Err(e) = self.post_data_receive() {
                warn!(id = %self.local_id, error = %e, "failed to repost data receive");
            }
        } else {
            debug!(id = %self.local_id, free, "receive ring full, parking data receive");
            self.receive_parked.store(true, Ordering::SeqCst);
            self.repost_parked_receive();
        }
    }

    /// Reposts the data receive once the reader has made room for a full message.
    fn repost_parked_receive(&self) {
        if !self.is_live() || !self.receive_parked.load(Ordering::SeqCst) {
            return;
        }
        let free = lock(&self.recv_ring).as_ref().map_or(0, RingBuffer::free);
        if free >= self.max_message_size && self.receive_parked.swap(false, Ordering::SeqCst) {
            match self.post_data_receive() {
                Ok(()) => trace!(id = %self.local_id, free, "data receive reposted"),
                Err(e) => warn!(id = %self.local_id, error = %e, "failed to repost data receive"),
            }
        }
    }

    fn send_flush(&self) {
        let (Some(endpoint), Some(peer)) = (self.endpoint(), self.peer_id.get().copied()) else {
            return;
        };
        match endpoint.send_tagged(Bytes::new(), Tag::new(MessageKind::Flush, peer), false) {
            Ok(()) => {
                self.metrics.inc_flushes_sent();
                debug!(id = %self.local_id, "flush sent");
            }
            Err(e) => warn!(id = %self.local_id, error = %e, "failed to send flush"),
        }
    }

    fn on_flush(&self) {
        let released = lock(&self.flow).on_flush();
        self.metrics.inc_flushes_received();
        debug!(id = %self.local_id, released, "flush received");
        if let Err(e) = self.post_flush_receive() {
            warn!(id = %self.local_id, error = %e, "failed to repost flush receive");
        }
    }

    fn fail(&self, fault: TransportFault) {
        if !self.is_live() {
            return;
        }
        self.metrics.inc_transport_errors();
        {
            let mut status = lock(&self.status);
            status.fault.get_or_insert(fault);
        }
        error!(id = %self.local_id, %fault, "transport error, closing channel");
        self.shutdown(true);
    }

    /// Releases the endpoint, worker, buffers and connection id exactly once.
    /// With `keep_unread`, buffered inbound bytes stay readable until drained.
    fn shutdown(&self, keep_unread: bool) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        lock(&self.status).state = ChannelState::Closed;

        let endpoint = lock(&self.endpoint).take();
        if let Some(endpoint) = endpoint {
            endpoint.close();
        }
        self.worker.close();

        lock(&self.send_ring).take();
        {
            let mut recv = lock(&self.recv_ring);
            if !keep_unread || recv.as_ref().map_or(true, RingBuffer::is_empty) {
                recv.take();
            }
        }
        tag::release(self.local_id);
        true
    }
}

/// A connected (or connecting) byte-stream channel.
pub struct SocketChannel {
    core: Arc<Core>,
    binding: Arc<dyn TransportBinding>,
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("id", &self.core.local_id)
            .field("peer", &self.peer_id())
            .field("state", &self.state())
            .field("binding", &self.binding.name())
            .finish()
    }
}

impl SocketChannel {
    /// Opens an unconnected channel with a freshly generated connection id.
    pub fn open(binding: Arc<dyn TransportBinding>, config: &ChannelConfig) -> Result<Self> {
        Self::open_with_id(binding, config, tag::next_id())
    }

    /// Opens an unconnected channel with a caller-chosen connection id. Fails
    /// if another live channel holds `id`.
    pub fn open_with_id(
        binding: Arc<dyn TransportBinding>,
        config: &ChannelConfig,
        id: ConnectionId,
    ) -> Result<Self> {
        config.validate()?;
        tag::claim(id)?;
        Self::build(binding, config, id).inspect_err(|_| tag::release(id))
    }

    fn build(binding: Arc<dyn TransportBinding>, config: &ChannelConfig, id: ConnectionId) -> Result<Self> {
        let send_ring = RingBuffer::new(config.buffer_capacity)?;
        let recv_ring = RingBuffer::new(config.buffer_capacity)?;
        let worker = binding.create_worker()?;

        let core = Arc::new(Core {
            local_id: id,
            peer_id: OnceLock::new(),
            max_message_size: config.max_message_size,
            worker,
            endpoint: Mutex::new(None),
            live: AtomicBool::new(true),
            blocking: AtomicBool::new(config.blocking),
            receive_parked: AtomicBool::new(false),
            status: Mutex::new(Status {
                state: ChannelState::Idle,
                handshake: Handshake::new(),
                remote: None,
                input_shut: false,
                output_shut: false,
                fault: None,
                rejected: None,
                attempt: 0,
                connect_finished: false,
            }),
            send_ring: Mutex::new(Some(send_ring)),
            recv_ring: Mutex::new(Some(recv_ring)),
            flow: Mutex::new(FlowControl::new(config.flush_interval, config.max_message_size)),
            metrics: ChannelMetrics::new(),
        });

        let weak = Arc::downgrade(&core);
        core.worker.set_receive_callback(Arc::new(move |outcome: ReceiveOutcome| {
            if let Some(core) = weak.upgrade() {
                core.on_receive(outcome);
            }
        }));

        debug!(
            id = %id,
            binding = binding.name(),
            capacity = config.buffer_capacity,
            flush_interval = config.flush_interval,
            max_message_size = config.max_message_size,
            "channel opened"
        );
        Ok(Self { core, binding })
    }

    /// Opens a channel answering an inbound request. The handshake is posted
    /// but not awaited.
    pub(crate) fn accepted(
        binding: Arc<dyn TransportBinding>,
        config: &ChannelConfig,
        request: ConnectionRequest,
    ) -> Result<Self> {
        let channel = Self::open(Arc::clone(&binding), config)?;
        let client = request.client_address;
        let endpoint = binding.accept(channel.core.worker.as_ref(), request)?;
        {
            let mut status = lock(&channel.core.status);
            status.state = ChannelState::Handshaking;
            status.connect_finished = true;
        }
        channel.attach(endpoint)?;
        info!(id = %channel.core.local_id, %client, "accepted connection");
        Ok(channel)
    }

    /// Connects to `address` (`host:port`). In blocking mode this waits for
    /// the handshake and returns `true`; otherwise it returns `false` and the
    /// caller completes the connection with [`finish_connect`](Self::finish_connect).
    pub fn connect(&self, address: &str) -> Result<bool> {
        let remote: SocketAddr = address.parse().map_err(|_| ChannelError::InvalidAddress {
            addr: address.to_string(),
        })?;
        self.connect_to(remote)
    }

    /// Same as [`connect`](Self::connect) with a parsed address.
    pub fn connect_to(&self, remote: SocketAddr) -> Result<bool> {
        {
            let mut status = lock(&self.core.status);
            match status.state {
                ChannelState::Idle => {
                    status.state = ChannelState::Handshaking;
                    status.rejected = None;
                }
                ChannelState::Handshaking => return Err(ChannelError::ConnectionPending),
                ChannelState::Connected => return Err(ChannelError::AlreadyConnected),
                ChannelState::Closed => return Err(closed_error(status.fault)),
            }
        }

        let endpoint = match self.binding.connect(self.core.worker.as_ref(), remote) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let mut status = lock(&self.core.status);
                if status.state == ChannelState::Handshaking {
                    status.state = ChannelState::Idle;
                }
                warn!(id = %self.core.local_id, %remote, error = %e, "connect failed");
                return Err(e);
            }
        };
        info!(id = %self.core.local_id, %remote, "connecting");
        self.attach(endpoint)?;

        if self.is_blocking() {
            self.finish_connect()
        } else {
            Ok(false)
        }
    }

    fn attach(&self, endpoint: Arc<dyn Endpoint>) -> Result<()> {
        let attempt = {
            let mut status = lock(&self.core.status);
            status.attempt += 1;
            status.attempt
        };
        let weak = Arc::downgrade(&self.core);
        endpoint.set_send_callback(Arc::new(move |outcome: SendOutcome| {
            if let Some(core) = weak.upgrade() {
                core.on_send(attempt, outcome);
            }
        }));
        let weak = Arc::downgrade(&self.core);
        endpoint.set_error_callback(Arc::new(move |fault: TransportFault| {
            if let Some(core) = weak.upgrade() {
                if core.is_current(attempt) {
                    core.fail(fault);
                }
            }
        }));

        lock(&self.core.status).remote = endpoint.remote_address();
        *lock(&self.core.endpoint) = Some(Arc::clone(&endpoint));

        let local = self.core.local_id;
        let (tag, mask) = handshake::receive_tag();
        self.core.worker.receive_tagged(HANDSHAKE_LEN, tag, mask, true)?;
        endpoint.send_tagged(handshake::encode(local), handshake::send_tag(local), true)?;
        debug!(id = %local, "handshake posted");
        Ok(())
    }

    /// Completes a pending connection. Returns `true` once connected. In
    /// non-blocking mode a single progress pass is made and `false` returned
    /// if the handshake is still outstanding.
    pub fn finish_connect(&self) -> Result<bool> {
        let mut polled = false;
        loop {
            {
                let mut status = lock(&self.core.status);
                match status.state {
                    ChannelState::Connected => {
                        status.connect_finished = true;
                        return Ok(true);
                    }
                    ChannelState::Closed => return Err(closed_error(status.fault)),
                    ChannelState::Idle => {
                        return Err(match status.rejected {
                            Some(got) => ChannelError::HandshakeRejected {
                                expected: CONNECTION_MAGIC,
                                got,
                            },
                            None => ChannelError::NotConnected,
                        })
                    }
                    ChannelState::Handshaking => {}
                }
            }
            if self.is_blocking() {
                self.core.park()?;
            } else if polled {
                return Ok(false);
            } else {
                self.core.worker.progress()?;
                polled = true;
            }
        }
    }

    /// Reads buffered bytes into `dst`.
    ///
    /// Non-blocking reads return `Read(0)` when nothing is buffered, including
    /// while the handshake is still outstanding. Blocking reads wait for the
    /// connection and at least one byte. After input shutdown, or once a
    /// failed connection's remaining bytes are drained, reads report
    /// [`ReadOutcome::EndOfStream`].
    pub fn read(&self, dst: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            let outcome = self.try_read(dst)?;
            if outcome != ReadOutcome::Read(0) || dst.is_empty() || !self.is_blocking() {
                return Ok(outcome);
            }
            self.core.park()?;
        }
    }

    fn try_read(&self, dst: &mut [u8]) -> Result<ReadOutcome> {
        {
            let status = lock(&self.core.status);
            if status.input_shut {
                return Ok(ReadOutcome::EndOfStream);
            }
            match status.state {
                ChannelState::Connected => {}
                ChannelState::Handshaking => return Ok(ReadOutcome::Read(0)),
                ChannelState::Closed if status.fault.is_some() => {}
                ChannelState::Closed => return Err(ChannelError::ChannelClosed),
                ChannelState::Idle => return Err(ChannelError::NotConnected),
            }
        }

        let n = {
            let mut guard = lock(&self.core.recv_ring);
            let Some(ring) = guard.as_mut() else {
                return Ok(ReadOutcome::EndOfStream);
            };
            let n = ring.read_into(dst);
            if n == 0 && !dst.is_empty() && !self.core.is_live() {
                guard.take();
                return Ok(ReadOutcome::EndOfStream);
            }
            n
        };

        if n > 0 {
            self.core.metrics.add_bytes_read(n as u64);
            trace!(id = %self.core.local_id, n, "read");
            self.core.repost_parked_receive();
        }
        Ok(ReadOutcome::Read(n))
    }

    /// Writes bytes from `src`, returning how many were accepted.
    ///
    /// Non-blocking writes take what the send ring and flow-control window
    /// allow, possibly 0, and nothing before the handshake completes. Blocking
    /// writes wait until all of `src` is accepted.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        let mut total = 0;
        loop {
            total += self.try_write(&src[total..])?;
            if total == src.len() || !self.is_blocking() {
                return Ok(total);
            }
            self.core.park()?;
        }
    }

    fn try_write(&self, src: &[u8]) -> Result<usize> {
        {
            let status = lock(&self.core.status);
            match status.state {
                ChannelState::Connected => {}
                ChannelState::Handshaking => return Ok(0),
                ChannelState::Closed => return Err(closed_error(status.fault)),
                ChannelState::Idle => return Err(ChannelError::NotConnected),
            }
            if status.output_shut {
                return Err(ChannelError::OutputShutdown);
            }
        }
        let (Some(endpoint), Some(peer)) = (self.core.endpoint(), self.peer_id()) else {
            return Err(ChannelError::NotConnected);
        };
        let tag = Tag::new(MessageKind::Data, peer);

        let mut ring_guard = lock(&self.core.send_ring);
        let Some(ring) = ring_guard.as_mut() else {
            return Err(ChannelError::ChannelClosed);
        };
        let mut flow = lock(&self.core.flow);
        let max = flow.max_message_size();

        let mut written = 0;
        while written < src.len() {
            if flow.send_credits() == 0 {
                if written == 0 {
                    self.core.metrics.inc_write_stalls();
                    trace!(id = %self.core.local_id, "write stalled awaiting flush");
                }
                break;
            }
            let n = ring.writable_window().len().min(max).min(src.len() - written);
            if n == 0 {
                break;
            }
            let chunk = &src[written..written + n];
            // A slot is only claimed once the transport took the message; the
            // send completion reclaims it.
            if let Err(e) = endpoint.send_tagged(Bytes::copy_from_slice(chunk), tag, true) {
                if written == 0 {
                    return Err(e);
                }
                warn!(id = %self.core.local_id, written, error = %e, "send failed after partial write");
                break;
            }
            ring.writable_window()[..n].copy_from_slice(chunk);
            ring.advance_write(n)?;
            if flow.record_send() {
                debug!(id = %self.core.local_id, "flush window exhausted, awaiting acknowledgment");
            }
            self.core.metrics.inc_messages_sent();
            written += n;
        }
        drop(flow);
        drop(ring_guard);

        self.core.metrics.add_bytes_written(written as u64);
        Ok(written)
    }

    /// Drives the transport once, then reports readiness:
    /// READ if unread bytes are buffered, WRITE if connected with output open,
    /// CONNECT from `connect` until [`finish_connect`](Self::finish_connect)
    /// reports the connection established.
    pub fn ready_ops(&self) -> ReadyOps {
        if let Err(e) = self.core.worker.progress() {
            warn!(id = %self.core.local_id, error = %e, "progress failed");
        }

        let mut ops = ReadyOps::empty();
        let input_shut = {
            let status = lock(&self.core.status);
            if status.connect_outstanding() {
                ops |= ReadyOps::CONNECT;
            }
            if status.state == ChannelState::Connected && !status.output_shut {
                ops |= ReadyOps::WRITE;
            }
            status.input_shut
        };
        let buffered = lock(&self.core.recv_ring).as_ref().is_some_and(|r| !r.is_empty());
        if buffered && !input_shut {
            ops |= ReadyOps::READ;
        }
        ops
    }

    /// Drives the transport once. Returns whether any completion ran.
    pub fn select(&self) -> Result<bool> {
        self.core.worker.progress()
    }

    /// Stops reading. Later reads report end of stream.
    pub fn shutdown_input(&self) -> Result<()> {
        let mut status = lock(&self.core.status);
        Self::ensure_connected(&status)?;
        status.input_shut = true;
        debug!(id = %self.core.local_id, "input shut down");
        Ok(())
    }

    /// Stops writing. Later writes fail with [`ChannelError::OutputShutdown`].
    pub fn shutdown_output(&self) -> Result<()> {
        let mut status = lock(&self.core.status);
        Self::ensure_connected(&status)?;
        status.output_shut = true;
        debug!(id = %self.core.local_id, "output shut down");
        Ok(())
    }

    fn ensure_connected(status: &Status) -> Result<()> {
        match status.state {
            ChannelState::Connected => Ok(()),
            ChannelState::Closed => Err(closed_error(status.fault)),
            ChannelState::Idle | ChannelState::Handshaking => Err(ChannelError::NotConnected),
        }
    }

    /// Closes the channel, releasing the endpoint, worker, buffers and
    /// connection id. Safe to call more than once.
    pub fn close(&self) {
        let closed = self.core.shutdown(false);
        lock(&self.core.recv_ring).take();
        if closed {
            info!(id = %self.core.local_id, "channel closed");
        }
    }

    /// Switches between blocking and non-blocking I/O.
    pub fn configure_blocking(&self, blocking: bool) -> Result<()> {
        if !self.core.is_live() {
            return Err(ChannelError::ChannelClosed);
        }
        self.core.blocking.store(blocking, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the blocking mode is set.
    pub fn is_blocking(&self) -> bool {
        self.core.blocking.load(Ordering::SeqCst)
    }

    /// Whether the channel has not been closed.
    pub fn is_open(&self) -> bool {
        self.core.is_live()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        lock(&self.core.status).state
    }

    /// Whether the handshake has completed in both directions.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Whether a connect was started and not yet finished.
    pub fn is_connection_pending(&self) -> bool {
        lock(&self.core.status).connect_outstanding()
    }

    /// Whether `shutdown_input` was called.
    pub fn is_input_shutdown(&self) -> bool {
        lock(&self.core.status).input_shut
    }

    /// Whether `shutdown_output` was called.
    pub fn is_output_shutdown(&self) -> bool {
        lock(&self.core.status).output_shut
    }

    /// This channel's connection id.
    pub fn local_id(&self) -> ConnectionId {
        self.core.local_id
    }

    /// The peer's connection id, known once connected.
    pub fn peer_id(&self) -> Option<ConnectionId> {
        self.core.peer_id.get().copied()
    }

    /// Address of the peer, once an endpoint exists.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        lock(&self.core.status).remote
    }

    /// The fault that closed the channel, if any.
    pub fn fault(&self) -> Option<TransportFault> {
        lock(&self.core.status).fault
    }

    /// Sender-side flow-control state.
    pub fn flow_state(&self) -> FlowControlState {
        lock(&self.core.flow).state()
    }

    /// Whether the sender is latched waiting for a FLUSH.
    pub fn is_awaiting_ack(&self) -> bool {
        lock(&self.core.flow).is_awaiting_ack()
    }

    /// Unread bytes in the receive ring.
    pub fn buffered(&self) -> usize {
        lock(&self.core.recv_ring).as_ref().map_or(0, RingBuffer::occupied)
    }

    /// Bytes written but not yet confirmed sent.
    pub fn in_flight(&self) -> usize {
        lock(&self.core.send_ring).as_ref().map_or(0, RingBuffer::occupied)
    }

    /// Whether both rings have been released.
    pub fn buffers_released(&self) -> bool {
        lock(&self.core.send_ring).is_none() && lock(&self.core.recv_ring).is_none()
    }

    /// Snapshot of this channel's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }
}

impl Selectable for SocketChannel {
    fn ready_ops(&self) -> ReadyOps {
        SocketChannel::ready_ops(self)
    }

    fn select(&self) -> Result<bool> {
        SocketChannel::select(self)
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.core.shutdown(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackFabric;
    use std::net::{IpAddr, Ipv4Addr};

    const PORT: u16 = 2998;

    fn server_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), PORT)
    }

    fn non_blocking(capacity: usize, k: u32, m: usize) -> ChannelConfig {
        ChannelConfig {
            buffer_capacity: capacity,
            flush_interval: k,
            max_message_size: m,
            blocking: false,
            ..Default::default()
        }
    }

    fn drive(a: &SocketChannel, b: &SocketChannel, done: impl Fn() -> bool) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            a.select().unwrap();
            b.select().unwrap();
        }
        assert!(done(), "condition not reached");
    }

    fn connected_pair(config: &ChannelConfig) -> (LoopbackFabric, SocketChannel, SocketChannel) {
        let fabric = LoopbackFabric::default();
        let binding: Arc<dyn TransportBinding> = Arc::new(fabric.clone());
        let listener = binding.listen(server_addr(), 4).unwrap();

        let client = SocketChannel::open(Arc::clone(&binding), config).unwrap();
        assert!(!client.connect(&server_addr().to_string()).unwrap());
        let request = listener.poll_request().unwrap();
        let server = SocketChannel::accepted(binding, config, request).unwrap();

        drive(&client, &server, || client.is_connected() && server.is_connected());
        (fabric, client, server)
    }

    fn read_all(reader: &SocketChannel, writer: &SocketChannel, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; len.max(1)];
        for _ in 0..1000 {
            if out.len() >= len {
                break;
            }
            writer.select().unwrap();
            reader.select().unwrap();
            let n = reader.read(&mut buf).unwrap().bytes();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_open_starts_idle() {
        let fabric = LoopbackFabric::default();
        let channel = SocketChannel::open(Arc::new(fabric.clone()), &ChannelConfig::default()).unwrap();
        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(channel.is_open());
        assert!(channel.is_blocking());
        assert_eq!(channel.peer_id(), None);
        assert_eq!(fabric.worker_count(), 1);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = ChannelConfig {
            buffer_capacity: 10,
            flush_interval: 2,
            max_message_size: 6,
            ..Default::default()
        };
        assert!(matches!(
            SocketChannel::open(Arc::new(LoopbackFabric::default()), &config),
            Err(ChannelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_duplicate_id_rejected_until_closed() {
        let binding: Arc<dyn TransportBinding> = Arc::new(LoopbackFabric::default());
        let config = ChannelConfig::default();
        let id = tag::next_id();
        let first = SocketChannel::open_with_id(Arc::clone(&binding), &config, id).unwrap();
        assert!(matches!(
            SocketChannel::open_with_id(Arc::clone(&binding), &config, id),
            Err(ChannelError::DuplicateConnectionId(_))
        ));
        first.close();
        SocketChannel::open_with_id(binding, &config, id).unwrap();
    }

    #[test]
    fn test_connect_invalid_address() {
        let channel = SocketChannel::open(Arc::new(LoopbackFabric::default()), &ChannelConfig::default()).unwrap();
        assert!(matches!(
            channel.connect("not-an-address"),
            Err(ChannelError::InvalidAddress { .. })
        ));
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn test_connect_refused_stays_idle() {
        let channel = SocketChannel::open(Arc::new(LoopbackFabric::default()), &ChannelConfig::default()).unwrap();
        assert!(matches!(
            channel.connect("127.0.0.1:9"),
            Err(ChannelError::ConnectionRefused { .. })
        ));
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn test_handshake_connects_both_sides() {
        let (_fabric, client, server) = connected_pair(&non_blocking(1024, 4, 256));
        assert_eq!(client.peer_id(), Some(server.local_id()));
        assert_eq!(server.peer_id(), Some(client.local_id()));
        assert_eq!(client.remote_address(), Some(server_addr()));
        assert!(server.remote_address().is_some());
        assert!(client.ready_ops().contains(ReadyOps::WRITE));
        assert!(client.ready_ops().contains(ReadyOps::CONNECT));
        assert!(client.is_connection_pending());
        assert!(client.finish_connect().unwrap());
        assert!(!client.ready_ops().contains(ReadyOps::CONNECT));
        assert!(!client.is_connection_pending());
        assert!(!server.ready_ops().contains(ReadyOps::CONNECT));
    }

    #[test]
    fn test_connect_twice_rejected() {
        let (_fabric, client, _server) = connected_pair(&non_blocking(1024, 4, 256));
        assert!(matches!(
            client.connect(&server_addr().to_string()),
            Err(ChannelError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_io_before_connect_rejected() {
        let channel = SocketChannel::open(Arc::new(LoopbackFabric::default()), &non_blocking(64, 2, 32)).unwrap();
        assert!(matches!(channel.write(b"x"), Err(ChannelError::NotConnected)));
        assert!(matches!(channel.read(&mut [0u8; 4]), Err(ChannelError::NotConnected)));
        assert!(matches!(channel.finish_connect(), Err(ChannelError::NotConnected)));
    }

    #[test]
    fn test_io_while_handshaking_would_block() {
        let binding: Arc<dyn TransportBinding> = Arc::new(LoopbackFabric::default());
        let _listener = binding.listen(server_addr(), 4).unwrap();
        let client = SocketChannel::open(binding, &non_blocking(64, 2, 32)).unwrap();
        assert!(!client.connect(&server_addr().to_string()).unwrap());
        assert_eq!(client.write(b"early").unwrap(), 0);
        assert_eq!(client.read(&mut [0u8; 4]).unwrap(), ReadOutcome::Read(0));
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_failed_send_claims_no_ring_space() {
        let (_fabric, client, _server) = connected_pair(&non_blocking(64, 4, 16));
        client.core.endpoint().unwrap().close();
        assert!(matches!(
            client.write(b"abc"),
            Err(ChannelError::Transport(TransportFault::EndpointClosed))
        ));
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.metrics().messages_sent, 0);
        assert_eq!(client.metrics().bytes_written, 0);
        assert!(!client.is_awaiting_ack());
    }

    #[test]
    fn test_small_write_arrives_in_order() {
        let (_fabric, client, server) = connected_pair(&non_blocking(1024, 4, 256));
        let payload: Vec<u8> = (0..10).collect();
        assert_eq!(client.write(&payload).unwrap(), 10);
        assert_eq!(read_all(&server, &client, 10), payload);
        assert_eq!(client.metrics().bytes_written, 10);
        assert_eq!(server.metrics().bytes_read, 10);
    }

    #[test]
    fn test_write_split_by_max_message_size() {
        let (_fabric, client, server) = connected_pair(&non_blocking(64, 4, 16));
        let payload: Vec<u8> = (0..40).collect();
        assert_eq!(client.write(&payload).unwrap(), 40);
        assert_eq!(client.metrics().messages_sent, 3);
        assert_eq!(read_all(&server, &client, 40), payload);
    }

    #[test]
    fn test_write_stalls_until_flush() {
        let (_fabric, client, server) = connected_pair(&non_blocking(16, 2, 8));
        let payload: Vec<u8> = (0..40).collect();
        assert_eq!(client.write(&payload).unwrap(), 16);
        assert!(client.is_awaiting_ack());
        assert_eq!(client.flow_state(), FlowControlState::Blocked);
        assert_eq!(client.write(&payload[16..]).unwrap(), 0);
        assert_eq!(client.metrics().write_stalls, 1);

        assert_eq!(read_all(&server, &client, 16), payload[..16].to_vec());
        drive(&client, &server, || !client.is_awaiting_ack());
        assert_eq!(server.metrics().flushes_sent, 1);
        assert_eq!(client.metrics().flushes_received, 1);
        assert_eq!(client.write(&payload[16..]).unwrap(), 16);
    }

    #[test]
    fn test_full_receive_ring_parks_receive() {
        let (_fabric, client, server) = connected_pair(&non_blocking(16, 2, 8));
        assert_eq!(client.write(&[1u8; 16]).unwrap(), 16);
        drive(&client, &server, || server.buffered() == 16 && !client.is_awaiting_ack());

        assert_eq!(client.write(&[2u8; 8]).unwrap(), 8);
        for _ in 0..10 {
            client.select().unwrap();
            server.select().unwrap();
        }
        assert_eq!(server.buffered(), 16);

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Read(16));
        assert_eq!(buf, [1u8; 16]);
        drive(&client, &server, || server.buffered() == 8);
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Read(8));
        assert_eq!(buf, [2u8; 8]);
    }

    #[test]
    fn test_ready_ops_read_tracks_buffer() {
        let (_fabric, client, server) = connected_pair(&non_blocking(1024, 4, 256));
        assert!(!server.ready_ops().contains(ReadyOps::READ));
        client.write(b"ping").unwrap();
        client.select().unwrap();
        assert!(server.ready_ops().contains(ReadyOps::READ));
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Read(4));
        assert!(!server.ready_ops().contains(ReadyOps::READ));
    }

    #[test]
    fn test_shutdown_input_and_output() {
        let (_fabric, client, server) = connected_pair(&non_blocking(1024, 4, 256));
        client.write(b"data").unwrap();
        drive(&client, &server, || server.buffered() == 4);

        server.shutdown_input().unwrap();
        assert!(server.is_input_shutdown());
        assert_eq!(server.read(&mut [0u8; 4]).unwrap(), ReadOutcome::EndOfStream);
        assert!(!server.ready_ops().contains(ReadyOps::READ));

        client.shutdown_output().unwrap();
        assert!(matches!(client.write(b"x"), Err(ChannelError::OutputShutdown)));
        assert!(!client.ready_ops().contains(ReadyOps::WRITE));
    }

    #[test]
    fn test_close_is_idempotent_and_releases() {
        let (fabric, client, server) = connected_pair(&non_blocking(1024, 4, 256));
        client.close();
        client.close();
        assert_eq!(client.state(), ChannelState::Closed);
        assert!(!client.is_open());
        assert!(client.buffers_released());
        assert!(matches!(client.write(b"x"), Err(ChannelError::ChannelClosed)));
        assert!(matches!(client.read(&mut [0u8; 1]), Err(ChannelError::ChannelClosed)));
        assert!(matches!(client.configure_blocking(true), Err(ChannelError::ChannelClosed)));
        assert_eq!(fabric.worker_count(), 1);
        drop(server);
        assert_eq!(fabric.worker_count(), 0);
        assert_eq!(fabric.endpoint_count(), 0);
    }

    #[test]
    fn test_peer_close_drains_then_ends() {
        let (_fabric, client, server) = connected_pair(&non_blocking(1024, 4, 256));
        client.write(b"bye").unwrap();
        client.select().unwrap();
        client.close();

        server.select().unwrap();
        assert_eq!(server.state(), ChannelState::Closed);
        assert_eq!(server.fault(), Some(TransportFault::ConnectionReset));

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Read(3));
        assert_eq!(&buf[..3], b"bye");
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::EndOfStream);
        assert!(server.buffers_released());
        assert!(matches!(
            server.write(b"x"),
            Err(ChannelError::Transport(TransportFault::ConnectionReset))
        ));
        assert_eq!(server.metrics().transport_errors, 1);
    }

    #[test]
    fn test_unanswered_handshake_stays_pending() {
        let fabric = LoopbackFabric::default();
        let binding: Arc<dyn TransportBinding> = Arc::new(fabric);
        let _listener = binding.listen(server_addr(), 4).unwrap();
        let client = SocketChannel::open(binding, &non_blocking(64, 2, 32)).unwrap();
        assert!(!client.connect(&server_addr().to_string()).unwrap());

        for _ in 0..10 {
            assert!(!client.finish_connect().unwrap());
        }
        assert!(client.is_connection_pending());
        assert_eq!(client.state(), ChannelState::Handshaking);
        assert!(client.ready_ops().contains(ReadyOps::CONNECT));
        assert!(matches!(
            client.connect(&server_addr().to_string()),
            Err(ChannelError::ConnectionPending)
        ));
    }
}
