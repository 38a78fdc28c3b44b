use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use crate::cancellation::CancellationSource;
use crate::codec::FramingVariant;
use crate::error::{CancelReason, ConnectionError, ConnectionFault, RequestFault};
use crate::handler::{Handler, HandlerRegistry, HandlerRegistryBuilder, HandshakeHandler, Responder};
use crate::message::{Header, HandshakeRequest, HandshakeResponse, Message, MessageType, RequestId, RpcFault};
use crate::receiver::{Receiver, ReceiverEvent};
use crate::request_table::{RequestTable, Resolution, ResolveOutcome};
use crate::sender::Sender;

/// Tuning knobs fixed for the lifetime of a connection. Construct through
/// [`ConnectionBuilder`] rather than directly.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub variant: FramingVariant,
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            variant: FramingVariant::JsonStream,
            protocol_version: 1,
            min_protocol_version: 1,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-request tuning passed to [`Connection::send_request`].
#[derive(Clone, Copy, Debug)]
pub struct RequestOptions {
    /// Cancel the request if no terminal response (or, when `keep_alive` is
    /// set, no `ProgressResponse`) arrives within this window.
    pub timeout: Option<Duration>,
    /// When set, an inbound `ProgressResponse` resets the timeout clock
    /// instead of being ignored.
    pub keep_alive: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { timeout: None, keep_alive: false }
    }
}

/// A handle to a single outstanding outbound request: its streamed
/// `IntermediateResultResponse` payloads and its eventual terminal result.
pub struct RequestHandle<T> {
    request_id: RequestId,
    table: Arc<RequestTable>,
    pub progress: mpsc::UnboundedReceiver<serde_json::Value>,
    response: oneshot::Receiver<Result<T, RequestFault>>,
}

impl<T> RequestHandle<T> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Cancels the request. A no-op if it has already settled.
    pub async fn cancel(&self) {
        self.table.cancel(self.request_id, CancelReason::CallerRequested).await;
    }

    /// Waits for the terminal response.
    pub async fn wait(self) -> Result<T, RequestFault> {
        match self.response.await {
            Ok(result) => result,
            Err(_) => Err(RequestFault::Local("response channel closed before resolving".into())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    ReadyToConnect = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::ReadyToConnect,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::ReadyToConnect as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Bumps the state to at least `to`, respecting monotonic ordering.
    /// Returns `true` if this call performed the bump.
    fn advance_to_at_least(&self, to: ConnectionState) -> bool {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.0.compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// The bidirectional RPC runtime: one [`Sender`] and one [`Receiver`] over a
/// duplex byte stream, a [`RequestTable`] for requests sent out, and a
/// registry of [`Handler`]s for requests received.
///
/// Build with [`ConnectionBuilder`]. Always used behind an `Arc`, since the
/// dispatch task and every `send_request` caller share it concurrently.
pub struct Connection<R, W> {
    config: ConnectionConfig,
    sender: Arc<Sender<W>>,
    receiver: Arc<Receiver<R>>,
    request_table: Arc<RequestTable>,
    handlers: HandlerRegistry,
    inbound_inflight: Mutex<HashMap<RequestId, CancellationSource>>,
    state: StateCell,
    closed_notify: Notify,
    fault_sinks: Mutex<Vec<mpsc::UnboundedSender<ConnectionFault>>>,
    remote_handshake_fired: Arc<AtomicBool>,
    remote_handshake_latch: Arc<Notify>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ReceiverEvent>>>,
    events_tx: mpsc::UnboundedSender<ReceiverEvent>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        reader: R,
        writer: W,
        config: ConnectionConfig,
        registry_builder: HandlerRegistryBuilder,
    ) -> Arc<Self> {
        let sender = Arc::new(Sender::new(writer, config.variant));
        let receiver = Arc::new(Receiver::new(reader));

        let sender_for_sink = Arc::clone(&sender);
        let frame_sink: crate::request_table::FrameSink = Arc::new(move |message: Message| {
            if let Err(err) = sender_for_sink.send(message) {
                tracing::debug!(error = %err, "dropped frame, sender already closed");
            }
        });
        let request_table = RequestTable::new(frame_sink);

        let remote_handshake_fired = Arc::new(AtomicBool::new(false));
        let remote_handshake_latch = Arc::new(Notify::new());
        let handshake_handler: Arc<dyn Handler> = Arc::new(HandshakeHandler {
            fired: Arc::clone(&remote_handshake_fired),
            latch: Arc::clone(&remote_handshake_latch),
            local_protocol_version: config.protocol_version,
        });
        let handlers = registry_builder.build(handshake_handler);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            sender,
            receiver,
            request_table,
            handlers,
            inbound_inflight: Mutex::new(HashMap::new()),
            state: StateCell::new(),
            closed_notify: Notify::new(),
            fault_sinks: Mutex::new(Vec::new()),
            remote_handshake_fired,
            remote_handshake_latch,
            events_rx: Mutex::new(Some(events_rx)),
            events_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Starts the sender and receiver background tasks and performs the
    /// concurrent bidirectional handshake. On failure the connection
    /// transitions directly to `Closed`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.state
            .transition(ConnectionState::ReadyToConnect, ConnectionState::Connecting)
            .map_err(|actual| {
                ConnectionError::HandshakeFailed(format!("connect() called from state {actual:?}"))
            })?;

        let (write_fault_tx, write_fault_rx) = mpsc::unbounded_channel();
        self.sender.connect(write_fault_tx).await?;
        self.receiver.connect(self.config.variant, self.events_tx.clone()).await?;

        let events_rx = self
            .events_rx
            .lock()
            .await
            .take()
            .expect("events receiver taken exactly once by connect()");
        let dispatch_self = Arc::clone(self);
        tokio::spawn(async move { dispatch_self.dispatch_loop(events_rx).await });

        let write_fault_self = Arc::clone(self);
        tokio::spawn(async move { write_fault_self.write_fault_loop(write_fault_rx).await });

        match self.perform_handshake().await {
            Ok(()) => {
                self.state
                    .transition(ConnectionState::Connecting, ConnectionState::Connected)
                    .map_err(|actual| {
                        ConnectionError::HandshakeFailed(format!("unexpected state {actual:?} after handshake"))
                    })?;
                Ok(())
            }
            Err(err) => {
                self.begin_closing().await;
                Err(err)
            }
        }
    }

    async fn perform_handshake(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let payload = HandshakeRequest {
            protocol_version: self.config.protocol_version,
            min_protocol_version: self.config.min_protocol_version,
            methods: self.handlers.methods(),
        };

        let local = self
            .send_request_unchecked::<_, HandshakeResponse>(
                "Handshake",
                payload,
                RequestOptions { timeout: Some(self.config.handshake_timeout), keep_alive: false },
            )
            .await;
        let local = local.wait();

        let remote_fired = Arc::clone(&self.remote_handshake_fired);
        let remote_latch = Arc::clone(&self.remote_handshake_latch);
        let remote = async move {
            let notified = remote_latch.notified();
            if !remote_fired.load(Ordering::SeqCst) {
                notified.await;
            }
        };

        let timeout = self.config.handshake_timeout;
        tokio::select! {
            result = async { tokio::join!(local, remote) } => {
                let (local_result, ()) = result;
                local_result
                    .map(|_| ())
                    .map_err(|err| ConnectionError::HandshakeFailed(err.to_string()))
            }
            _ = tokio::time::sleep(timeout) => {
                Err(ConnectionError::HandshakeTimeout(timeout))
            }
        }
    }

    /// Sends a request and returns a handle to its progress stream and
    /// terminal result. Fails immediately with [`ConnectionError::NotConnected`]
    /// unless the connection is fully `Connected`.
    pub async fn send_request<TReq, TRes>(
        self: &Arc<Self>,
        method: &str,
        payload: TReq,
        options: RequestOptions,
    ) -> Result<RequestHandle<TRes>, ConnectionError>
    where
        TReq: Serialize,
        TRes: DeserializeOwned + Send + 'static,
    {
        if self.state.get() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        Ok(self.send_request_unchecked(method, payload, options).await)
    }

    /// Registers the outbound context and awaits that registration before
    /// enqueuing the frame, so a response racing the send can never find an
    /// empty table.
    async fn send_request_unchecked<TReq, TRes>(
        self: &Arc<Self>,
        method: &str,
        payload: TReq,
        options: RequestOptions,
    ) -> RequestHandle<TRes>
    where
        TReq: Serialize,
        TRes: DeserializeOwned + Send + 'static,
    {
        let request_id = RequestId::new_v4();
        let (response_tx, response_rx) = oneshot::channel::<Result<TRes, RequestFault>>();

        let resolve: Box<dyn FnOnce(Resolution) + Send> = Box::new(move |resolution| {
            let result = match resolution {
                Resolution::Success(value) => serde_json::from_value::<TRes>(value)
                    .map_err(|err| RequestFault::Local(format!("failed to decode response: {err}"))),
                Resolution::Error(fault) => {
                    Err(RequestFault::Remote { code: fault.code, message: fault.message, data: fault.data })
                }
                Resolution::Cancelled(reason) => Err(RequestFault::Cancelled(reason)),
            };
            let _ = response_tx.send(result);
        });

        let (_cancel, progress) = self
            .request_table
            .register(request_id, options.keep_alive, options.timeout, resolve)
            .await;

        match serde_json::to_value(payload) {
            Ok(payload_value) => {
                let message = Message::request(request_id, method.to_string(), payload_value);
                if self.sender.send(message).is_err() {
                    self.request_table.cancel(request_id, CancelReason::ConnectionClosed).await;
                }
            }
            Err(err) => {
                tracing::warn!(%request_id, error = %err, "failed to encode outbound request payload");
                self.request_table.cancel(request_id, CancelReason::ConnectionClosed).await;
            }
        }

        RequestHandle { request_id, table: Arc::clone(&self.request_table), progress, response: response_rx }
    }

    /// Enqueues a `Close` frame for the peer. Distinct from [`Connection::close`]:
    /// this only notifies the remote side, it does not tear down local state.
    pub fn send_close_message(&self) -> Result<(), ConnectionError> {
        self.sender.send(Message::close())
    }

    /// Idempotently tears the connection down: cancels every outstanding
    /// request with [`CancelReason::ConnectionClosed`], stops the sender and
    /// receiver, and transitions to `Closed`.
    pub async fn close(self: &Arc<Self>) {
        self.begin_closing().await;
        self.wait_for_close().await;
    }

    pub async fn wait_for_close(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.state.get() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    async fn begin_closing(self: &Arc<Self>) {
        if !self.state.advance_to_at_least(ConnectionState::Closing) {
            return;
        }
        self.request_table.cancel_all(CancelReason::ConnectionClosed).await;
        self.receiver.close();
        self.sender.close().await;
        let _ = self.state.transition(ConnectionState::Closing, ConnectionState::Closed);
        self.closed_notify.notify_waiters();
    }

    /// Subscribes to connection-wide fault events (malformed frames, orphan
    /// responses, handler failures) that aren't tied to any single
    /// `RequestHandle`.
    pub async fn subscribe_faults(&self) -> mpsc::UnboundedReceiver<ConnectionFault> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.fault_sinks.lock().await.push(tx);
        rx
    }

    async fn emit_fault(&self, fault: ConnectionFault) {
        tracing::warn!(fault = %fault, "connection fault");
        let mut sinks = self.fault_sinks.lock().await;
        sinks.retain(|sink| sink.send(fault.clone()).is_ok());
    }

    /// Surfaces a writer-task I/O failure as a connection fault and begins
    /// tearing the connection down. A write failure has no corresponding
    /// read-side EOF, so nothing else would ever move the connection out of
    /// `Connected` in that case.
    async fn write_fault_loop(self: Arc<Self>, mut faults: mpsc::UnboundedReceiver<ConnectionError>) {
        if let Some(err) = faults.recv().await {
            self.emit_fault(ConnectionFault::Io(err.to_string())).await;
            self.begin_closing().await;
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ReceiverEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ReceiverEvent::Message(message) => self.handle_message(&message).await,
                ReceiverEvent::Fault(err) => {
                    self.emit_fault(ConnectionFault::Codec(err.to_string())).await;
                    self.begin_closing().await;
                }
                ReceiverEvent::Eof => {
                    self.begin_closing().await;
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: &Message) {
        let Header { message_type, method, request_id, .. } = message.header.clone();
        match message_type {
            MessageType::Request => self.handle_inbound_request(request_id, method, message.payload.clone()).await,
            MessageType::SuccessResponse => {
                match self.request_table.resolve_success(request_id, message.payload.clone()).await {
                    ResolveOutcome::Resolved => {}
                    ResolveOutcome::RecentlyCancelled => {
                        tracing::debug!(%request_id, "success response for a recently cancelled request, dropping");
                    }
                    ResolveOutcome::Orphan => {
                        self.emit_fault(ConnectionFault::OrphanResponse { request_id }).await;
                    }
                }
            }
            MessageType::ErrorResponse => {
                let fault: RpcFault = serde_json::from_value(message.payload.clone()).unwrap_or_else(|_| {
                    RpcFault::new("MalformedHeader", "error response payload did not match RpcFault")
                });
                match self.request_table.resolve_error(request_id, fault).await {
                    ResolveOutcome::Resolved => {}
                    ResolveOutcome::RecentlyCancelled => {
                        tracing::debug!(%request_id, "error response for a recently cancelled request, dropping");
                    }
                    ResolveOutcome::Orphan => {
                        self.emit_fault(ConnectionFault::OrphanResponse { request_id }).await;
                    }
                }
            }
            MessageType::IntermediateResultResponse => {
                let _ = self.request_table.deliver_intermediate(request_id, message.payload.clone()).await;
            }
            MessageType::ProgressResponse => {
                let _ = self.request_table.note_progress(request_id).await;
            }
            MessageType::Cancel => self.cancel_inbound(request_id).await,
            MessageType::Close => self.begin_closing().await,
        }
    }

    async fn cancel_inbound(&self, request_id: RequestId) {
        if let Some(cancel) = self.inbound_inflight.lock().await.get(&request_id) {
            cancel.trigger(CancelReason::CallerRequested);
        }
    }

    async fn handle_inbound_request(self: &Arc<Self>, request_id: RequestId, method: Option<String>, payload: serde_json::Value) {
        let Some(method) = method else {
            let _ = self.sender.send(Message::error(
                request_id,
                &RpcFault::new("MalformedHeader", "request frame missing Method"),
            ));
            return;
        };

        let Some(handler) = self.handlers.get(&method) else {
            tracing::warn!(%request_id, %method, "no handler registered for inbound request");
            let _ = self.sender.send(Message::error(
                request_id,
                &RpcFault::new("UnknownMethod", format!("no handler registered for `{method}`")),
            ));
            return;
        };

        let cancel = CancellationSource::new();
        self.inbound_inflight.lock().await.insert(request_id, cancel.clone());

        let sender = Arc::clone(&self.sender);
        let responder_sink: crate::request_table::FrameSink = Arc::new(move |message: Message| {
            if let Err(err) = sender.send(message) {
                tracing::debug!(error = %err, "dropped responder frame, sender already closed");
            }
        });
        let responder = Responder::new(request_id, responder_sink);

        let connection = Arc::clone(self);
        let method_name = method.clone();
        tokio::spawn(async move {
            let outcome = handler.handle(payload, responder, cancel).await;
            connection.inbound_inflight.lock().await.remove(&request_id);
            match outcome {
                Ok(value) => {
                    let _ = connection.sender.send(Message::success(request_id, value));
                }
                Err(err) => {
                    connection.emit_fault(ConnectionFault::HandlerFault {
                        method: method_name.clone(),
                        message: err.to_string(),
                    }).await;
                    let _ = connection.sender.send(Message::error(
                        request_id,
                        &RpcFault::new("HandlerFault", err.to_string()),
                    ));
                }
            }
        });
    }
}
