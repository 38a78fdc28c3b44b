//! Tracks requests this side has sent and is waiting on a response for.
//!
//! Each pending request is a single type-erased completion slot keyed by
//! `RequestId`: the typed deserialization happens inline, inside the boxed
//! closure captured at registration time, so the table itself stays
//! homogeneous over the result type.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use crate::cancellation::CancellationSource;
use crate::error::CancelReason;
use crate::message::{Message, RequestId, RpcFault};

/// How an outstanding request was finally settled.
pub enum Resolution {
    Success(Value),
    Error(RpcFault),
    Cancelled(CancelReason),
}

/// Outcome of trying to resolve a terminal response against the table. The
/// connection uses this to tell a genuinely unknown `RequestId` (faulted as
/// an orphan response) apart from a response that simply lost the race with
/// a local cancellation or timeout (dropped silently) — both present
/// identically as "no entry found" in the entries map itself.
#[derive(Debug, Eq, PartialEq)]
pub enum ResolveOutcome {
    Resolved,
    RecentlyCancelled,
    Orphan,
}

/// Bound on how many recently-cancelled ids are remembered for the
/// silent-drop check above. A long-lived connection that cancels many
/// requests should not grow this set without bound; the oldest entries are
/// evicted once the cap is hit, which only risks misclassifying a very
/// late, very delayed response as an orphan instead of a silent drop —
/// never the reverse.
const RECENTLY_CANCELLED_CAPACITY: usize = 1024;

/// Type-erased sink used to emit frames (a `Cancel` frame on timeout or
/// explicit cancellation) without making the table generic over the
/// transport's writer type.
pub type FrameSink = Arc<dyn Fn(Message) + Send + Sync>;

struct PendingRequest {
    resolve: Box<dyn FnOnce(Resolution) + Send>,
    progress_sink: mpsc::UnboundedSender<Value>,
    keep_alive: bool,
    timeout: Option<Duration>,
    deadline: Option<Arc<Mutex<Instant>>>,
    cancel: CancellationSource,
    done: Arc<Notify>,
}

/// Tracks all requests sent by this side that have not yet been resolved.
pub struct RequestTable {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
    recently_cancelled: Mutex<RecentlyCancelled>,
    sink: FrameSink,
}

#[derive(Default)]
struct RecentlyCancelled {
    order: VecDeque<RequestId>,
    set: HashSet<RequestId>,
}

impl RecentlyCancelled {
    fn remember(&mut self, request_id: RequestId) {
        if self.set.insert(request_id) {
            self.order.push_back(request_id);
            if self.order.len() > RECENTLY_CANCELLED_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }

    fn contains(&self, request_id: &RequestId) -> bool {
        self.set.contains(request_id)
    }
}

impl RequestTable {
    pub fn new(sink: FrameSink) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            recently_cancelled: Mutex::new(RecentlyCancelled::default()),
            sink,
        })
    }

    /// Registers a newly sent request. Must be called before the request
    /// frame is handed to the sender, so that a response racing the
    /// insertion is never treated as orphaned.
    pub async fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        keep_alive: bool,
        timeout: Option<Duration>,
        resolve: Box<dyn FnOnce(Resolution) + Send>,
    ) -> (CancellationSource, mpsc::UnboundedReceiver<Value>) {
        let cancel = CancellationSource::new();
        let done = Arc::new(Notify::new());
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let deadline = timeout.map(|d| Arc::new(Mutex::new(Instant::now() + d)));

        let entry = PendingRequest {
            resolve,
            progress_sink: progress_tx,
            keep_alive,
            timeout,
            deadline: deadline.clone(),
            cancel: cancel.clone(),
            done: done.clone(),
        };
        self.entries.lock().await.insert(request_id, entry);

        if let (Some(duration), Some(deadline)) = (timeout, deadline) {
            self.spawn_timeout_driver(request_id, duration, deadline, done);
        }

        (cancel, progress_rx)
    }

    fn spawn_timeout_driver(
        self: &Arc<Self>,
        request_id: RequestId,
        initial: Duration,
        deadline: Arc<Mutex<Instant>>,
        done: Arc<Notify>,
    ) {
        let table = Arc::clone(self);
        let mut target = Instant::now() + initial;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(target) => {
                        let current = *deadline.lock().await;
                        if current <= Instant::now() {
                            table.cancel(request_id, CancelReason::Timeout).await;
                            return;
                        }
                        target = current;
                    }
                    _ = done.notified() => return,
                }
            }
        });
    }

    /// Resolves a `SuccessResponse`.
    pub async fn resolve_success(&self, request_id: RequestId, payload: Value) -> ResolveOutcome {
        let Some(entry) = self.entries.lock().await.remove(&request_id) else {
            return self.classify_missing(request_id).await;
        };
        entry.done.notify_waiters();
        (entry.resolve)(Resolution::Success(payload));
        ResolveOutcome::Resolved
    }

    /// Resolves an `ErrorResponse`.
    pub async fn resolve_error(&self, request_id: RequestId, fault: RpcFault) -> ResolveOutcome {
        let Some(entry) = self.entries.lock().await.remove(&request_id) else {
            return self.classify_missing(request_id).await;
        };
        entry.done.notify_waiters();
        (entry.resolve)(Resolution::Error(fault));
        ResolveOutcome::Resolved
    }

    async fn classify_missing(&self, request_id: RequestId) -> ResolveOutcome {
        if self.recently_cancelled.lock().await.contains(&request_id) {
            ResolveOutcome::RecentlyCancelled
        } else {
            ResolveOutcome::Orphan
        }
    }

    /// Forwards an `IntermediateResultResponse` payload to the request's
    /// progress stream. Returns `false` on an orphan response.
    pub async fn deliver_intermediate(&self, request_id: RequestId, payload: Value) -> bool {
        let guard = self.entries.lock().await;
        match guard.get(&request_id) {
            Some(entry) => {
                let _ = entry.progress_sink.send(payload);
                true
            }
            None => false,
        }
    }

    /// Records a keep-alive `ProgressResponse`, extending the request's
    /// timeout deadline if one is configured. Returns `false` on an orphan
    /// response.
    pub async fn note_progress(&self, request_id: RequestId) -> bool {
        let guard = self.entries.lock().await;
        let Some(entry) = guard.get(&request_id) else {
            return false;
        };
        if entry.keep_alive {
            if let (Some(deadline), Some(duration)) = (&entry.deadline, entry.timeout) {
                *deadline.lock().await = Instant::now() + duration;
            }
        }
        true
    }

    /// Cancels a single outstanding request, emitting a `Cancel` frame the
    /// first time this happens for it. Returns `false` if the request had
    /// already settled or never existed.
    pub async fn cancel(self: &Arc<Self>, request_id: RequestId, reason: CancelReason) -> bool {
        let Some(entry) = self.entries.lock().await.remove(&request_id) else {
            return false;
        };
        self.recently_cancelled.lock().await.remember(request_id);
        if entry.cancel.trigger(reason) && !matches!(reason, CancelReason::ConnectionClosed) {
            (self.sink)(Message::cancel(request_id));
        }
        entry.done.notify_waiters();
        (entry.resolve)(Resolution::Cancelled(reason));
        true
    }

    /// Cancels every outstanding request, used when the connection is
    /// tearing down. Does not emit `Cancel` frames for `ConnectionClosed`,
    /// since the peer is assumed to be observing the same teardown.
    pub async fn cancel_all(self: &Arc<Self>, reason: CancelReason) {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        if !drained.is_empty() {
            let mut recently_cancelled = self.recently_cancelled.lock().await;
            for (request_id, _) in &drained {
                recently_cancelled.remember(*request_id);
            }
        }
        for (request_id, entry) in drained {
            if entry.cancel.trigger(reason) && !matches!(reason, CancelReason::ConnectionClosed) {
                (self.sink)(Message::cancel(request_id));
            }
            entry.done.notify_waiters();
            (entry.resolve)(Resolution::Cancelled(reason));
        }
    }

    pub async fn is_outstanding(&self, request_id: RequestId) -> bool {
        self.entries.lock().await.contains_key(&request_id)
    }

    pub async fn outstanding_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
