#![forbid(unsafe_code)]
//! Bidirectional, peer-to-peer RPC runtime over a duplex text stream.
//!
//! Two endpoints exchange framed JSON messages over a duplex byte stream —
//! canonically a spawned plugin process's stdin/stdout — to make requests of
//! each other, stream progress and partial results, cancel in-flight work,
//! and shut down gracefully. The runtime multiplexes many concurrent
//! outgoing and incoming requests on one pair of streams, enforces
//! per-request timeouts with keep-alive extension, and performs a mandatory
//! handshake before application traffic.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duplex_rpc::{ConnectionBuilder, Handler, HandlerError, Responder, CancellationSource};
//! use async_trait::async_trait;
//! use serde_json::Value;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Handler for Echo {
//!     async fn handle(&self, payload: Value, _responder: Responder, _cancel: CancellationSource) -> Result<Value, HandlerError> {
//!         Ok(payload)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (local, remote) = tokio::io::duplex(4096);
//! let (local_read, local_write) = tokio::io::split(local);
//! let connection = ConnectionBuilder::new()
//!     .handler("Echo", Arc::new(Echo))
//!     .build(local_read, local_write);
//! connection.connect().await?;
//! # let _ = remote;
//! # Ok(()) }
//! ```
//!
//! See [`Connection`] for the orchestrator and [`ConnectionBuilder`] for
//! assembling one; [`ChildProcessLauncher`] wires a connection to a spawned
//! plugin process's stdio directly.

mod builder;
mod cancellation;
mod codec;
#[cfg(feature = "config")]
mod config;
mod connection;
mod error;
mod handler;
mod message;
mod process;
mod receiver;
mod request_table;
mod sender;

pub use builder::ConnectionBuilder;
pub use cancellation::CancellationSource;
pub use codec::FramingVariant;
#[cfg(feature = "config")]
pub use config::{load_plugins, ConfigError, ConnectionFileConfig, FramingVariantConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionState, RequestHandle, RequestOptions};
pub use error::{CancelReason, ConnectionError, ConnectionFault, HandlerError, RequestFault};
pub use handler::{Handler, HandlerRegistry, Responder};
pub use message::{Header, HandshakeRequest, HandshakeResponse, Message, MessageType, RequestId, RpcFault};
pub use process::ChildProcessLauncher;
