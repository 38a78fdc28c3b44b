//! Owns the read half of the duplex stream. A single background task decodes
//! frames and forwards them over a channel; routing and handler dispatch
//! happen downstream so a slow handler never stalls the next read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::io::{AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::codec::{self, FramingVariant};
use crate::error::ConnectionError;
use crate::message::Message;

pub enum ReceiverEvent {
    Message(Message),
    Fault(ConnectionError),
    Eof,
}

pub struct Receiver<R> {
    reader: StdMutex<Option<BufReader<R>>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    stopping: Arc<AtomicBool>,
}

impl<R> Receiver<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: StdMutex::new(Some(BufReader::new(reader))),
            task: AsyncMutex::new(None),
            connected: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the background reader task. May only be called once.
    pub async fn connect(
        &self,
        variant: FramingVariant,
        events: mpsc::UnboundedSender<ReceiverEvent>,
    ) -> Result<(), ConnectionError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .expect("reader taken exactly once, guarded by `connected`");
        let stopping = Arc::clone(&self.stopping);
        let handle = tokio::spawn(reader_task(reader, variant, events, stopping));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Requests the reader task stop at its next decoded-message boundary.
    /// A read already blocked in the kernel on an empty pipe cannot
    /// generally be interrupted portably, so this does not join the task;
    /// it naturally exits once the peer closes its end or the next frame
    /// finishes decoding.
    pub fn close(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

async fn reader_task<R: AsyncRead + Unpin>(
    mut reader: BufReader<R>,
    variant: FramingVariant,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    stopping: Arc<AtomicBool>,
) {
    let mut scratch = Vec::new();
    loop {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        match codec::decode_message(&mut reader, variant, &mut scratch).await {
            Ok(Some(message)) => {
                if events.send(ReceiverEvent::Message(message)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = events.send(ReceiverEvent::Eof);
                return;
            }
            Err(err) => {
                let _ = events.send(ReceiverEvent::Fault(err));
                return;
            }
        }
    }
}
