#![warn(missing_docs)]

//! verbsock-counter: two channels over the loopback fabric exchange increasing
//! counters in lockstep, then report their metrics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use verbsock::metrics::MetricsSnapshot;
use verbsock::selector::Token;
use verbsock::{
    EngineConfig, LoopbackFabric, ReadOutcome, ReadyOps, ServerSocketChannel, SocketChannel,
    TransportBinding, Selector,
};

#[derive(Parser)]
#[command(name = "verbsock-counter")]
#[command(about = "Exchange increasing counters between two verbsock channels", long_about = None)]
struct Cli {
    /// Address the server side binds to.
    #[arg(short, long, default_value = "127.0.0.1:2998")]
    address: SocketAddr,

    /// Number of counters each side sends.
    #[arg(short = 'n', long, default_value = "1000")]
    count: u32,

    /// Use blocking channels on two threads instead of one selector loop.
    #[arg(short, long)]
    blocking: bool,

    /// TOML or JSON engine configuration.
    #[arg(short, long, env = "VERBSOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let fabric = LoopbackFabric::new(config.loopback.clone());
    let binding: Arc<dyn TransportBinding> = Arc::new(fabric);

    tracing::info!(
        address = %cli.address,
        count = cli.count,
        blocking = cli.blocking,
        "verbsock counter starting"
    );

    let started = Instant::now();
    let (client, server) = if cli.blocking {
        run_blocking(binding, &config, cli.address, cli.count)?
    } else {
        run_selector(binding, &config, cli.address, cli.count)?
    };
    let elapsed = started.elapsed();

    let report = serde_json::json!({
        "mode": if cli.blocking { "blocking" } else { "selector" },
        "rounds": cli.count,
        "elapsed_us": elapsed.as_micros() as u64,
        "client": client,
        "server": server,
        "total": client.merge(&server),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_exact(channel: &SocketChannel, dst: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < dst.len() {
        match channel.read(&mut dst[filled..])? {
            ReadOutcome::Read(n) => filled += n,
            ReadOutcome::EndOfStream => bail!("peer closed the stream"),
        }
    }
    Ok(())
}

fn exchange_blocking(channel: &SocketChannel, rounds: u32) -> Result<MetricsSnapshot> {
    let mut buf = [0u8; 4];
    for counter in 0..rounds {
        channel.write(&counter.to_be_bytes())?;
        read_exact(channel, &mut buf)?;
        let remote = u32::from_be_bytes(buf);
        ensure!(remote == counter, "expected counter {counter}, got {remote}");
        tracing::debug!(counter, "counter exchanged");
    }
    let metrics = channel.metrics();
    channel.close();
    Ok(metrics)
}

fn run_blocking(
    binding: Arc<dyn TransportBinding>,
    config: &EngineConfig,
    address: SocketAddr,
    rounds: u32,
) -> Result<(MetricsSnapshot, MetricsSnapshot)> {
    let mut channel_config = config.channel.clone();
    channel_config.blocking = true;

    let acceptor = ServerSocketChannel::open(Arc::clone(&binding), &channel_config)?;
    acceptor.bind_to(address, 1)?;

    let server = std::thread::spawn(move || -> Result<MetricsSnapshot> {
        let channel = acceptor
            .accept()?
            .context("blocking accept returned no channel")?;
        acceptor.close();
        exchange_blocking(&channel, rounds)
    });

    let client = SocketChannel::open(binding, &channel_config)?;
    client.connect_to(address)?;
    let client_metrics = exchange_blocking(&client, rounds)?;

    let server_metrics = match server.join() {
        Ok(result) => result?,
        Err(_) => bail!("server thread panicked"),
    };
    Ok((client_metrics, server_metrics))
}

/// Lockstep counter exchange driven by readiness events.
struct Handler {
    channel: Arc<SocketChannel>,
    rounds: u32,
    sent: u32,
    received: u32,
    outbound: Vec<u8>,
    inbound: Vec<u8>,
}

impl Handler {
    fn new(channel: Arc<SocketChannel>, rounds: u32) -> Self {
        Self {
            channel,
            rounds,
            sent: 0,
            received: 0,
            outbound: Vec::with_capacity(4),
            inbound: Vec::with_capacity(4),
        }
    }

    fn on_ready(&mut self, ops: ReadyOps) -> Result<()> {
        if ops.contains(ReadyOps::WRITE) {
            if self.outbound.is_empty() && self.sent < self.rounds && self.sent == self.received {
                self.outbound.extend_from_slice(&self.sent.to_be_bytes());
                self.sent += 1;
            }
            if !self.outbound.is_empty() {
                let n = self.channel.write(&self.outbound)?;
                self.outbound.drain(..n);
            }
        }

        if ops.contains(ReadyOps::READ) {
            let mut buf = [0u8; 4];
            let want = 4 - self.inbound.len();
            match self.channel.read(&mut buf[..want])? {
                ReadOutcome::Read(n) => self.inbound.extend_from_slice(&buf[..n]),
                ReadOutcome::EndOfStream => bail!(
                    "peer closed after {} of {} counters",
                    self.received,
                    self.rounds
                ),
            }
            if self.inbound.len() == 4 {
                let remote = u32::from_be_bytes([self.inbound[0], self.inbound[1], self.inbound[2], self.inbound[3]]);
                ensure!(remote == self.received, "expected counter {}, got {remote}", self.received);
                self.received += 1;
                self.inbound.clear();
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.sent == self.rounds && self.received == self.rounds && self.outbound.is_empty()
    }
}

const ACCEPTOR: Token = 0;
const CLIENT: Token = 1;
const SERVER: Token = 2;
const MAX_IDLE_ROUNDS: usize = 100_000;

fn run_selector(
    binding: Arc<dyn TransportBinding>,
    config: &EngineConfig,
    address: SocketAddr,
    rounds: u32,
) -> Result<(MetricsSnapshot, MetricsSnapshot)> {
    let mut channel_config = config.channel.clone();
    channel_config.blocking = false;

    let acceptor = Arc::new(ServerSocketChannel::open(Arc::clone(&binding), &channel_config)?);
    acceptor.bind_to(address, 1)?;

    let client = Arc::new(SocketChannel::open(binding, &channel_config)?);
    client.connect_to(address)?;

    let mut selector = Selector::new();
    selector.register(ACCEPTOR, acceptor.clone(), ReadyOps::ACCEPT);
    selector.register(CLIENT, client.clone(), ReadyOps::CONNECT);

    let mut handlers: HashMap<Token, Handler> = HashMap::new();
    let mut metrics: HashMap<Token, MetricsSnapshot> = HashMap::new();

    while !selector.is_empty() {
        let ready = selector.select(MAX_IDLE_ROUNDS);
        if ready.is_empty() {
            bail!("no channel became ready");
        }

        for (token, ops) in ready {
            match token {
                ACCEPTOR => {
                    if let Some(channel) = acceptor.accept()? {
                        let channel = Arc::new(channel);
                        selector.register(SERVER, channel.clone(), ReadyOps::READ | ReadyOps::WRITE);
                        handlers.insert(SERVER, Handler::new(channel, rounds));
                        selector.cancel(ACCEPTOR);
                        acceptor.close();
                    }
                }
                CLIENT if ops.contains(ReadyOps::CONNECT) => {
                    if client.finish_connect()? {
                        tracing::info!(peer = ?client.peer_id(), "client connected");
                        selector.set_interest(CLIENT, ReadyOps::READ | ReadyOps::WRITE);
                        handlers.insert(CLIENT, Handler::new(client.clone(), rounds));
                    }
                }
                _ => {
                    let Some(handler) = handlers.get_mut(&token) else {
                        continue;
                    };
                    handler.on_ready(ops)?;
                    if handler.is_done() {
                        metrics.insert(token, handler.channel.metrics());
                        selector.cancel(token);
                    }
                }
            }
        }
    }

    for handler in handlers.values() {
        handler.channel.close();
    }
    let client_metrics = metrics.remove(&CLIENT).unwrap_or_default();
    let server_metrics = metrics.remove(&SERVER).unwrap_or_default();
    Ok((client_metrics, server_metrics))
}
