//! # gamewire
//!
//! Networking core for multiplayer games: a compact binary message format,
//! a pluggable encryption/compression pipeline, a lightweight admission
//! handshake, and a TCP/UDP connection engine whose messages are dispatched
//! by HeadID on a pool of worker threads.
//!
//! ```no_run
//! use gamewire::{CodecPipeline, Dispatcher, Message, NetworkConfig, Server};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> gamewire::Result<()> {
//! let dispatcher = Dispatcher::new().with_head_action(5, "hello", |msg, _| {
//!     let greeting = msg.get::<String>()?;
//!     let number = msg.get::<i32>()?;
//!     tracing::info!(%greeting, number, "hello received");
//!     Ok(None)
//! })?;
//!
//! let (_stop, stop_rx) = mpsc::channel(1);
//! let server = Server::new(
//!     NetworkConfig::default(),
//!     Arc::new(CodecPipeline::passthrough()),
//!     Arc::new(dispatcher),
//! )
//! .start(stop_rx)
//! .await?;
//! # let _ = server;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::uint24::UInt24;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::dispatcher::{Dispatch, Dispatcher};
pub use crate::protocol::message::{Message, MessageKind};
pub use crate::protocol::pipeline::CodecPipeline;
pub use crate::protocol::router::{Role, SyncSink};
pub use crate::transport::client::Client;
pub use crate::transport::connection::{Connection, ConnectionEvent};
pub use crate::transport::server::{Server, ServerHandle};
