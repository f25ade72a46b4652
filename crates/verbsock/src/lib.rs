#![warn(missing_docs)]

//! verbsock: selector-compatible byte-stream channels over tagged RDMA-style messaging

pub mod acceptor;
pub mod binding;
pub mod channel;
pub mod config;
pub mod error;
pub mod flow;
pub mod handshake;
pub mod loopback;
pub mod metrics;
pub mod ring;
pub mod selector;
pub mod tag;

pub use acceptor::ServerSocketChannel;
pub use binding::TransportBinding;
pub use channel::{ChannelState, ReadOutcome, SocketChannel};
pub use config::{ChannelConfig, EngineConfig};
pub use error::{ChannelError, Result, TransportFault};
pub use loopback::LoopbackFabric;
pub use selector::{ReadyOps, Selectable, Selector};
