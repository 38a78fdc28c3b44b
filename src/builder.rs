//! Embedder-facing construction: accumulates handlers and tuning knobs before
//! a [`Connection`] is built, following an accumulate-then-`build()`
//! convention.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::FramingVariant;
use crate::connection::{Connection, ConnectionConfig};
use crate::handler::{Handler, HandlerRegistryBuilder};

/// Accumulates method handlers and lifecycle tuning before a [`Connection`]
/// is constructed over a concrete duplex stream. The `"Handshake"` method
/// name is reserved: registering a handler under it here is silently
/// overridden by the connection's built-in handshake handler.
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    handlers: HandlerRegistryBuilder,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self { config: ConnectionConfig::default(), handlers: HandlerRegistryBuilder::new() }
    }

    /// Selects the wire framing. Defaults to [`FramingVariant::JsonStream`].
    pub fn framing(mut self, variant: FramingVariant) -> Self {
        self.config.variant = variant;
        self
    }

    /// Sets the protocol version this endpoint advertises during handshake.
    pub fn protocol_version(mut self, version: u32) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Sets the minimum protocol version this endpoint accepts from a peer.
    pub fn min_protocol_version(mut self, version: u32) -> Self {
        self.config.min_protocol_version = version;
        self
    }

    /// Bounds how long [`Connection::connect`] waits for both directions of
    /// the handshake before failing with [`crate::ConnectionError::HandshakeTimeout`].
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Registers a handler for inbound requests naming `method`.
    pub fn handler(mut self, method: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers = self.handlers.register(method, handler);
        self
    }

    /// Builds the connection over an already-available duplex stream. The
    /// connection is not yet started — call [`Connection::connect`].
    pub fn build<R, W>(self, reader: R, writer: W) -> Arc<Connection<R, W>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Connection::new(reader, writer, self.config, self.handlers)
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
