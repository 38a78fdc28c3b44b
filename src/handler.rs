//! Inbound request handling: the trait user code implements, the narrow
//! capability handed to it while it runs, and the registry the connection
//! consults when an inbound `Request` frame names a method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::cancellation::CancellationSource;
use crate::error::{ConnectionError, HandlerError};
use crate::message::{HandshakeRequest, HandshakeResponse, Message, RequestId};
use crate::request_table::FrameSink;

/// Implemented by user code to answer inbound requests. One instance is
/// registered per method name.
///
/// `handle` runs on its own spawned task, so a slow handler never blocks the
/// receiver from decoding the next inbound frame. It may call back into
/// `responder` any number of times before returning, and should poll
/// `cancel` (or race it via `tokio::select!`) if the peer may send a
/// `Cancel` frame for long-running work.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        payload: Value,
        responder: Responder,
        cancel: CancellationSource,
    ) -> Result<Value, HandlerError>;
}

/// The capability a running handler is given to emit non-terminal frames for
/// its own request. Deliberately narrower than the connection itself, so a
/// handler can't reach back in and, say, close the connection or start a
/// second request under the same id.
#[derive(Clone)]
pub struct Responder {
    request_id: RequestId,
    sink: FrameSink,
}

impl Responder {
    pub(crate) fn new(request_id: RequestId, sink: FrameSink) -> Self {
        Self { request_id, sink }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Sends a keep-alive `ProgressResponse`, resetting the caller's timeout
    /// clock if they configured one.
    pub fn send_progress(&self) -> Result<(), ConnectionError> {
        (self.sink)(Message::progress(self.request_id));
        Ok(())
    }

    /// Sends a non-terminal `IntermediateResultResponse` payload.
    pub fn send_intermediate_result(&self, payload: Value) -> Result<(), ConnectionError> {
        (self.sink)(Message::intermediate_result(self.request_id, payload));
        Ok(())
    }
}

/// Maps method names to their handlers. Cheaply cloneable; every clone
/// shares the same underlying map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }

    pub fn methods(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// Accumulates method registrations before the registry is frozen.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, method: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(method.into(), handler);
        self
    }

    pub(crate) fn build(mut self, handshake: Arc<dyn Handler>) -> HandlerRegistry {
        self.handlers.insert("Handshake".to_string(), handshake);
        HandlerRegistry { handlers: Arc::new(self.handlers) }
    }
}

/// Built-in handler for the mandatory `Handshake` method. Registered
/// automatically; any user registration for `"Handshake"` is overridden.
pub(crate) struct HandshakeHandler {
    pub(crate) fired: Arc<AtomicBool>,
    pub(crate) latch: Arc<Notify>,
    pub(crate) local_protocol_version: u32,
}

#[async_trait]
impl Handler for HandshakeHandler {
    async fn handle(
        &self,
        payload: Value,
        _responder: Responder,
        _cancel: CancellationSource,
    ) -> Result<Value, HandlerError> {
        let _request: HandshakeRequest = serde_json::from_value(payload)?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.latch.notify_waiters();
        }
        Ok(serde_json::to_value(HandshakeResponse {
            protocol_version: Some(self.local_protocol_version),
        })
        .expect("HandshakeResponse always serializes"))
    }
}
