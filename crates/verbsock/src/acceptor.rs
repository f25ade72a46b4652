//! Listening channel.
//!
//! A [`ServerSocketChannel`] binds a transport listener and turns each inbound
//! connection request into a [`SocketChannel`] whose handshake is already
//! posted. The returned channel finishes connecting as either side progresses.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::binding::{Listener, TransportBinding};
use crate::channel::SocketChannel;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result, TransportFault};
use crate::selector::{ReadyOps, Selectable};

/// Backlog used by [`ServerSocketChannel::bind`] callers that pass 0.
pub const DEFAULT_BACKLOG: usize = 50;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Accepts inbound connections on a local address.
pub struct ServerSocketChannel {
    binding: Arc<dyn TransportBinding>,
    config: ChannelConfig,
    listener: Mutex<Option<Arc<dyn Listener>>>,
    open: AtomicBool,
    blocking: AtomicBool,
}

impl std::fmt::Debug for ServerSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSocketChannel")
            .field("local", &self.local_address())
            .field("open", &self.is_open())
            .field("binding", &self.binding.name())
            .finish()
    }
}

impl ServerSocketChannel {
    /// Opens an unbound acceptor. Accepted channels use `config`.
    pub fn open(binding: Arc<dyn TransportBinding>, config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            binding,
            blocking: AtomicBool::new(config.blocking),
            config: config.clone(),
            listener: Mutex::new(None),
            open: AtomicBool::new(true),
        })
    }

    /// Binds to `address`. A bare IP binds to the configured default port.
    /// A `backlog` of 0 selects [`DEFAULT_BACKLOG`].
    pub fn bind(&self, address: &str, backlog: usize) -> Result<()> {
        let local = match address.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => address
                .parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, self.config.default_port))
                .map_err(|_| ChannelError::InvalidAddress {
                    addr: address.to_string(),
                })?,
        };
        self.bind_to(local, backlog)
    }

    /// Same as [`bind`](Self::bind) with a parsed address.
    pub fn bind_to(&self, local: SocketAddr, backlog: usize) -> Result<()> {
        if !self.is_open() {
            return Err(ChannelError::ChannelClosed);
        }
        let mut slot = lock(&self.listener);
        if slot.is_some() {
            return Err(ChannelError::AlreadyBound);
        }
        let backlog = if backlog == 0 { DEFAULT_BACKLOG } else { backlog };
        *slot = Some(self.binding.listen(local, backlog)?);
        info!(%local, backlog, binding = self.binding.name(), "acceptor bound");
        Ok(())
    }

    /// Bound address, `None` until bound.
    pub fn local_address(&self) -> Option<SocketAddr> {
        lock(&self.listener).as_ref().map(|l| l.local_address())
    }

    fn listener(&self) -> Result<Arc<dyn Listener>> {
        if !self.is_open() {
            return Err(ChannelError::ChannelClosed);
        }
        lock(&self.listener).clone().ok_or(ChannelError::NotYetBound)
    }

    /// Accepts the next pending connection. Non-blocking acceptors return
    /// `None` when nothing is pending; blocking ones wait. Requests whose
    /// client has already gone away are skipped.
    pub fn accept(&self) -> Result<Option<SocketChannel>> {
        loop {
            let listener = self.listener()?;
            match listener.poll_request() {
                Some(request) => {
                    let client = request.client_address;
                    match SocketChannel::accepted(Arc::clone(&self.binding), &self.config, request) {
                        Ok(channel) => return Ok(Some(channel)),
                        Err(ChannelError::Transport(TransportFault::PeerUnreachable)) => {
                            warn!(%client, "skipping request from departed client");
                        }
                        Err(e) => return Err(e),
                    }
                }
                None if self.is_blocking() => std::thread::sleep(ACCEPT_POLL_INTERVAL),
                None => return Ok(None),
            }
        }
    }

    /// ACCEPT when a connection request is pending.
    pub fn ready_ops(&self) -> ReadyOps {
        let pending = lock(&self.listener).as_ref().map_or(0, |l| l.pending());
        if self.is_open() && pending > 0 {
            ReadyOps::ACCEPT
        } else {
            ReadyOps::empty()
        }
    }

    /// Stops listening; pending requests are refused. Safe to call more than once.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            let local = listener.local_address();
            listener.close();
            info!(%local, "acceptor closed");
        } else {
            debug!("unbound acceptor closed");
        }
    }

    /// Switches between blocking and polling `accept`.
    pub fn configure_blocking(&self, blocking: bool) -> Result<()> {
        if !self.is_open() {
            return Err(ChannelError::ChannelClosed);
        }
        self.blocking.store(blocking, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the blocking mode is set.
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    /// Whether `close` has not been called.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Whether `bind` succeeded.
    pub fn is_bound(&self) -> bool {
        lock(&self.listener).is_some()
    }
}

impl Selectable for ServerSocketChannel {
    fn ready_ops(&self) -> ReadyOps {
        ServerSocketChannel::ready_ops(self)
    }

    /// Listeners have no progress engine; requests queue as clients connect.
    fn select(&self) -> Result<bool> {
        Ok(self.ready_ops().contains(ReadyOps::ACCEPT))
    }
}

impl Drop for ServerSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}
