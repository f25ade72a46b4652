//! In-process loopback fabric.
//!
//! A software stand-in for an RDMA-capable messaging library, used by tests and
//! the demo binary. It follows the same completion model as real hardware:
//! sends deliver into the peer worker's unexpected-message queue immediately,
//! receives are matched against that queue by tag and mask, and every
//! completion is queued on the owning worker until that worker is progressed.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::binding::{
    ConnectionRequest, Endpoint, ErrorCallback, Listener, ReceiveCallback, ReceiveOutcome,
    Received, SendCallback, SendCompletion, SendOutcome, TransportBinding, Worker,
};
use crate::error::{ChannelError, Result, TransportFault};
use crate::tag::Tag;

const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// Loopback fabric configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Upper bound on the backlog a listener may request.
    pub backlog_limit: usize,
    /// How long `wait_for_event` parks before rechecking, in milliseconds.
    pub event_wait_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            backlog_limit: 128,
            event_wait_ms: 1,
        }
    }
}

/// Counters kept by the fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Tagged messages delivered to a peer.
    pub tagged_sent: u64,
    /// Stream bytes delivered to a peer.
    pub stream_bytes_sent: u64,
    /// Posted receives that matched a message.
    pub receives_completed: u64,
    /// Endpoints created by connect or accept.
    pub endpoints_created: u64,
    /// Endpoints released.
    pub endpoints_closed: u64,
    /// Endpoints failed by `fail_connections_to`.
    pub faults_injected: u64,
}

enum Outgoing {
    Tagged { tag: Tag, data: Bytes, use_callback: bool },
    Stream { data: Bytes, use_callback: bool },
}

struct PostedReceive {
    tag: Tag,
    mask: u64,
    capacity: usize,
    use_callback: bool,
}

struct PostedStreamReceive {
    endpoint: u64,
    capacity: usize,
    use_callback: bool,
}

enum Completion {
    Send { endpoint: u64, outcome: SendOutcome },
    Receive(ReceiveOutcome),
    EndpointError { endpoint: u64, fault: TransportFault },
}

#[derive(Default)]
struct WorkerState {
    posted: VecDeque<PostedReceive>,
    posted_stream: VecDeque<PostedStreamReceive>,
    unexpected: VecDeque<(Tag, Bytes)>,
    completions: VecDeque<Completion>,
    receive_callback: Option<ReceiveCallback>,
}

struct EndpointState {
    worker: u64,
    peer: Option<u64>,
    remote: Option<SocketAddr>,
    outbox: VecDeque<Outgoing>,
    stream_inbound: BytesMut,
    send_callback: Option<SendCallback>,
    error_callback: Option<ErrorCallback>,
    /// Set by fault injection; the link no longer carries traffic.
    failed: bool,
}

impl EndpointState {
    fn new(worker: u64, peer: Option<u64>, remote: Option<SocketAddr>) -> Self {
        Self {
            worker,
            peer,
            remote,
            outbox: VecDeque::new(),
            stream_inbound: BytesMut::new(),
            send_callback: None,
            error_callback: None,
            failed: false,
        }
    }
}

struct ListenerState {
    backlog: usize,
    pending: VecDeque<ConnectionRequest>,
}

#[derive(Default)]
struct FabricState {
    next_id: u64,
    next_port: u16,
    workers: HashMap<u64, WorkerState>,
    endpoints: HashMap<u64, EndpointState>,
    listeners: HashMap<SocketAddr, ListenerState>,
    requests: HashMap<u64, u64>,
    stats: FabricStats,
}

impl FabricState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn allocate_client_address(&mut self) -> SocketAddr {
        if self.next_port < FIRST_EPHEMERAL_PORT {
            self.next_port = FIRST_EPHEMERAL_PORT;
        }
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn find_listener(&mut self, addr: SocketAddr) -> Option<&mut ListenerState> {
        let key = if self.listeners.contains_key(&addr) {
            addr
        } else {
            *self
                .listeners
                .keys()
                .find(|bound| bound.ip().is_unspecified() && bound.port() == addr.port())?
        };
        self.listeners.get_mut(&key)
    }

    fn push_completion(&mut self, worker: u64, completion: Completion) {
        if let Some(state) = self.workers.get_mut(&worker) {
            state.completions.push_back(completion);
        }
    }

    /// Hands a message to the peer of `from`, or parks it until the peer accepts.
    fn deliver(&mut self, from: u64, outgoing: Outgoing) {
        let (sender_worker, peer, sender_failed) = match self.endpoints.get_mut(&from) {
            Some(ep) => match ep.peer {
                Some(peer) => (ep.worker, peer, ep.failed),
                None => {
                    ep.outbox.push_back(outgoing);
                    return;
                }
            },
            None => return,
        };

        let (tag, len, use_callback) = match &outgoing {
            Outgoing::Tagged { tag, data, use_callback } => (Some(*tag), data.len(), *use_callback),
            Outgoing::Stream { data, use_callback } => (None, data.len(), *use_callback),
        };

        let peer_worker = match self.endpoints.get_mut(&peer) {
            Some(peer_ep) if !sender_failed && !peer_ep.failed => {
                if let Outgoing::Stream { data, .. } = &outgoing {
                    peer_ep.stream_inbound.extend_from_slice(data);
                }
                Some(peer_ep.worker)
            }
            _ => None,
        };

        let outcome = match peer_worker {
            Some(worker) => {
                match outgoing {
                    Outgoing::Tagged { tag, data, .. } => {
                        if let Some(state) = self.workers.get_mut(&worker) {
                            state.unexpected.push_back((tag, data));
                        }
                        self.stats.tagged_sent += 1;
                    }
                    Outgoing::Stream { .. } => {
                        self.stats.stream_bytes_sent += len as u64;
                    }
                }
                Ok(SendCompletion { tag, len })
            }
            None => Err(TransportFault::ConnectionReset),
        };

        if use_callback {
            self.push_completion(sender_worker, Completion::Send { endpoint: from, outcome });
        }
    }

    fn match_receives(&mut self, worker: u64) {
        let Some(state) = self.workers.get_mut(&worker) else {
            return;
        };

        let mut i = 0;
        while i < state.posted.len() {
            let posted = &state.posted[i];
            let found = state
                .unexpected
                .iter()
                .position(|(tag, _)| tag.matches(posted.tag, posted.mask));
            let Some(pos) = found else {
                i += 1;
                continue;
            };
            let (Some(posted), Some((tag, data))) = (state.posted.remove(i), state.unexpected.remove(pos))
            else {
                break;
            };
            let outcome = if data.len() > posted.capacity {
                Err(TransportFault::Truncated {
                    len: data.len(),
                    capacity: posted.capacity,
                })
            } else {
                Ok(Received { tag: Some(tag), data })
            };
            self.stats.receives_completed += 1;
            if posted.use_callback {
                state.completions.push_back(Completion::Receive(outcome));
            }
        }

        let mut i = 0;
        while i < state.posted_stream.len() {
            let posted = &state.posted_stream[i];
            let Some(ep) = self.endpoints.get_mut(&posted.endpoint) else {
                state.posted_stream.remove(i);
                continue;
            };
            if ep.stream_inbound.is_empty() {
                i += 1;
                continue;
            }
            let n = ep.stream_inbound.len().min(posted.capacity);
            let data = ep.stream_inbound.split_to(n).freeze();
            let use_callback = posted.use_callback;
            state.posted_stream.remove(i);
            self.stats.receives_completed += 1;
            if use_callback {
                state
                    .completions
                    .push_back(Completion::Receive(Ok(Received { tag: None, data })));
            }
        }
    }

    fn close_endpoint(&mut self, id: u64, fault: TransportFault) {
        let Some(ep) = self.endpoints.remove(&id) else {
            return;
        };
        self.stats.endpoints_closed += 1;
        self.requests.retain(|_, client| *client != id);
        if let Some(peer) = ep.peer {
            if let Some(peer_worker) = self.endpoints.get(&peer).map(|p| p.worker) {
                self.push_completion(peer_worker, Completion::EndpointError { endpoint: peer, fault });
            }
        }
    }
}

struct FabricShared {
    config: LoopbackConfig,
    state: Mutex<FabricState>,
    events: Condvar,
}

impl FabricShared {
    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-process fabric connecting any number of workers.
#[derive(Clone)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

impl std::fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackFabric")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackFabric {
    /// Creates an empty fabric.
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            shared: Arc::new(FabricShared {
                config,
                state: Mutex::new(FabricState::default()),
                events: Condvar::new(),
            }),
        }
    }

    /// Configuration the fabric was built with.
    pub fn config(&self) -> &LoopbackConfig {
        &self.shared.config
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> FabricStats {
        self.shared.lock().stats.clone()
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.shared.lock().workers.len()
    }

    /// Number of live endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.shared.lock().endpoints.len()
    }

    /// Fails every endpoint whose remote address is `remote`, as a broken
    /// link would. Returns the number of endpoints affected.
    pub fn fail_connections_to(&self, remote: SocketAddr, fault: TransportFault) -> usize {
        let mut state = self.shared.lock();
        let targets: Vec<(u64, u64)> = state
            .endpoints
            .iter_mut()
            .filter(|(_, ep)| ep.remote == Some(remote))
            .map(|(id, ep)| {
                ep.failed = true;
                (*id, ep.worker)
            })
            .collect();
        for (endpoint, worker) in &targets {
            state.push_completion(*worker, Completion::EndpointError { endpoint: *endpoint, fault });
        }
        state.stats.faults_injected += targets.len() as u64;
        drop(state);
        self.shared.events.notify_all();
        warn!(%remote, count = targets.len(), %fault, "injected loopback fault");
        targets.len()
    }
}

impl TransportBinding for LoopbackFabric {
    fn name(&self) -> &str {
        "loopback"
    }

    fn create_worker(&self) -> Result<Arc<dyn Worker>> {
        let mut state = self.shared.lock();
        let id = state.allocate_id();
        state.workers.insert(id, WorkerState::default());
        trace!(worker = id, "loopback worker created");
        Ok(Arc::new(LoopbackWorker {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn connect(&self, worker: &dyn Worker, remote: SocketAddr) -> Result<Arc<dyn Endpoint>> {
        let mut state = self.shared.lock();
        if !state.workers.contains_key(&worker.id()) {
            return Err(ChannelError::Transport(TransportFault::EndpointClosed));
        }
        let request_id = state.allocate_id();
        let client_address = state.allocate_client_address();
        match state.find_listener(remote) {
            Some(listener) if listener.pending.len() < listener.backlog => {
                listener.pending.push_back(ConnectionRequest {
                    id: request_id,
                    client_address,
                });
            }
            _ => {
                return Err(ChannelError::ConnectionRefused {
                    addr: remote.to_string(),
                })
            }
        }
        let endpoint = state.allocate_id();
        state
            .endpoints
            .insert(endpoint, EndpointState::new(worker.id(), None, Some(remote)));
        state.requests.insert(request_id, endpoint);
        state.stats.endpoints_created += 1;
        drop(state);
        self.shared.events.notify_all();

        debug!(%remote, endpoint, "loopback endpoint connecting");
        Ok(Arc::new(LoopbackEndpoint {
            id: endpoint,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn accept(&self, worker: &dyn Worker, request: ConnectionRequest) -> Result<Arc<dyn Endpoint>> {
        let mut state = self.shared.lock();
        if !state.workers.contains_key(&worker.id()) {
            return Err(ChannelError::Transport(TransportFault::EndpointClosed));
        }
        let Some(client) = state.requests.remove(&request.id) else {
            return Err(ChannelError::Transport(TransportFault::PeerUnreachable));
        };
        if !state.endpoints.contains_key(&client) {
            return Err(ChannelError::Transport(TransportFault::PeerUnreachable));
        }

        let endpoint = state.allocate_id();
        state.endpoints.insert(
            endpoint,
            EndpointState::new(worker.id(), Some(client), Some(request.client_address)),
        );
        state.stats.endpoints_created += 1;

        let mut parked = VecDeque::new();
        if let Some(client_ep) = state.endpoints.get_mut(&client) {
            client_ep.peer = Some(endpoint);
            parked = std::mem::take(&mut client_ep.outbox);
        }
        for outgoing in parked {
            state.deliver(client, outgoing);
        }
        drop(state);
        self.shared.events.notify_all();

        debug!(client = %request.client_address, endpoint, "loopback endpoint accepted");
        Ok(Arc::new(LoopbackEndpoint {
            id: endpoint,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn listen(&self, local: SocketAddr, backlog: usize) -> Result<Arc<dyn Listener>> {
        let mut state = self.shared.lock();
        if state.listeners.contains_key(&local) {
            return Err(ChannelError::IoError(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{local} already has a listener"),
            )));
        }
        let backlog = backlog.clamp(1, self.shared.config.backlog_limit.max(1));
        state.listeners.insert(
            local,
            ListenerState {
                backlog,
                pending: VecDeque::new(),
            },
        );
        info!(%local, backlog, "loopback listener bound");
        Ok(Arc::new(LoopbackListener {
            local,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Worker handle on a [`LoopbackFabric`].
pub struct LoopbackWorker {
    id: u64,
    shared: Arc<FabricShared>,
}

enum Dispatch {
    Send(SendCallback, SendOutcome),
    Receive(ReceiveCallback, ReceiveOutcome),
    Error(ErrorCallback, TransportFault),
}

impl Worker for LoopbackWorker {
    fn id(&self) -> u64 {
        self.id
    }

    fn receive_tagged(
        &self,
        capacity: usize,
        tag: Tag,
        tag_mask: u64,
        use_callback: bool,
    ) -> Result<()> {
        let mut state = self.shared.lock();
        let worker = state
            .workers
            .get_mut(&self.id)
            .ok_or(ChannelError::Transport(TransportFault::EndpointClosed))?;
        worker.posted.push_back(PostedReceive {
            tag,
            mask: tag_mask,
            capacity,
            use_callback,
        });
        Ok(())
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        if let Some(worker) = self.shared.lock().workers.get_mut(&self.id) {
            worker.receive_callback = Some(callback);
        }
    }

    fn progress(&self) -> Result<bool> {
        // Callbacks run with the fabric unlocked; they post new operations.
        let dispatches: Vec<Dispatch> = {
            let mut state = self.shared.lock();
            state.match_receives(self.id);
            let Some(worker) = state.workers.get_mut(&self.id) else {
                return Ok(false);
            };
            let completions: Vec<Completion> = worker.completions.drain(..).collect();
            let receive_callback = worker.receive_callback.clone();
            completions
                .into_iter()
                .filter_map(|completion| match completion {
                    Completion::Send { endpoint, outcome } => state
                        .endpoints
                        .get(&endpoint)
                        .and_then(|ep| ep.send_callback.clone())
                        .map(|cb| Dispatch::Send(cb, outcome)),
                    Completion::Receive(outcome) => receive_callback
                        .clone()
                        .map(|cb| Dispatch::Receive(cb, outcome)),
                    Completion::EndpointError { endpoint, fault } => state
                        .endpoints
                        .get(&endpoint)
                        .and_then(|ep| ep.error_callback.clone())
                        .map(|cb| Dispatch::Error(cb, fault)),
                })
                .collect()
        };

        // Endpoint errors go last so data that arrived before a reset is seen.
        let (errors, mut dispatches): (Vec<Dispatch>, Vec<Dispatch>) = dispatches
            .into_iter()
            .partition(|d| matches!(d, Dispatch::Error(..)));
        dispatches.extend(errors);

        let did_work = !dispatches.is_empty();
        for dispatch in dispatches {
            match dispatch {
                Dispatch::Send(cb, outcome) => cb(outcome),
                Dispatch::Receive(cb, outcome) => cb(outcome),
                Dispatch::Error(cb, fault) => cb(fault),
            }
        }
        Ok(did_work)
    }

    fn wait_for_event(&self) -> Result<()> {
        let state = self.shared.lock();
        let ready = state
            .workers
            .get(&self.id)
            .map(|w| !w.completions.is_empty() || !w.unexpected.is_empty())
            .unwrap_or(true);
        if !ready {
            let wait = Duration::from_millis(self.shared.config.event_wait_ms);
            let _ = self
                .shared
                .events
                .wait_timeout(state, wait)
                .unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.shared.lock();
        if state.workers.remove(&self.id).is_some() {
            trace!(worker = self.id, "loopback worker closed");
        }
    }
}

/// Endpoint handle on a [`LoopbackFabric`].
pub struct LoopbackEndpoint {
    id: u64,
    shared: Arc<FabricShared>,
}

impl LoopbackEndpoint {
    fn post(&self, outgoing: Outgoing) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.endpoints.contains_key(&self.id) {
            return Err(ChannelError::Transport(TransportFault::EndpointClosed));
        }
        state.deliver(self.id, outgoing);
        drop(state);
        self.shared.events.notify_all();
        Ok(())
    }
}

impl Endpoint for LoopbackEndpoint {
    fn send_tagged(&self, data: Bytes, tag: Tag, use_callback: bool) -> Result<()> {
        self.post(Outgoing::Tagged {
            tag,
            data,
            use_callback,
        })
    }

    fn send_stream(&self, data: Bytes, use_callback: bool) -> Result<()> {
        self.post(Outgoing::Stream { data, use_callback })
    }

    fn receive_stream(&self, capacity: usize, use_callback: bool) -> Result<()> {
        let mut state = self.shared.lock();
        let worker = state
            .endpoints
            .get(&self.id)
            .map(|ep| ep.worker)
            .ok_or(ChannelError::Transport(TransportFault::EndpointClosed))?;
        let worker = state
            .workers
            .get_mut(&worker)
            .ok_or(ChannelError::Transport(TransportFault::EndpointClosed))?;
        worker.posted_stream.push_back(PostedStreamReceive {
            endpoint: self.id,
            capacity,
            use_callback,
        });
        Ok(())
    }

    fn set_send_callback(&self, callback: SendCallback) {
        if let Some(ep) = self.shared.lock().endpoints.get_mut(&self.id) {
            ep.send_callback = Some(callback);
        }
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        if let Some(ep) = self.shared.lock().endpoints.get_mut(&self.id) {
            ep.error_callback = Some(callback);
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.shared.lock().endpoints.get(&self.id).and_then(|ep| ep.remote)
    }

    fn close(&self) {
        let mut state = self.shared.lock();
        state.close_endpoint(self.id, TransportFault::ConnectionReset);
        drop(state);
        self.shared.events.notify_all();
    }
}

/// Listener handle on a [`LoopbackFabric`].
pub struct LoopbackListener {
    local: SocketAddr,
    shared: Arc<FabricShared>,
}

impl Listener for LoopbackListener {
    fn local_address(&self) -> SocketAddr {
        self.local
    }

    fn poll_request(&self) -> Option<ConnectionRequest> {
        self.shared
            .lock()
            .listeners
            .get_mut(&self.local)
            .and_then(|l| l.pending.pop_front())
    }

    fn pending(&self) -> usize {
        self.shared
            .lock()
            .listeners
            .get(&self.local)
            .map(|l| l.pending.len())
            .unwrap_or(0)
    }

    fn close(&self) {
        let mut state = self.shared.lock();
        let Some(listener) = state.listeners.remove(&self.local) else {
            return;
        };
        for request in listener.pending {
            if let Some(client) = state.requests.remove(&request.id) {
                if let Some(worker) = state.endpoints.get(&client).map(|ep| ep.worker) {
                    state.push_completion(
                        worker,
                        Completion::EndpointError {
                            endpoint: client,
                            fault: TransportFault::PeerUnreachable,
                        },
                    );
                }
            }
        }
        drop(state);
        self.shared.events.notify_all();
        info!(local = %self.local, "loopback listener closed");
    }
}
