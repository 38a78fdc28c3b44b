//! Owns the write half of the duplex stream. A single background task drains
//! a FIFO of outbound frames, so a slow or congested peer never blocks a
//! caller handing off a new message to send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::codec::{self, FramingVariant};
use crate::error::ConnectionError;
use crate::message::Message;

enum WriterCommand {
    Send(Message),
    Shutdown,
}

pub struct Sender<W> {
    variant: FramingVariant,
    tx: mpsc::UnboundedSender<WriterCommand>,
    rx: StdMutex<Option<mpsc::UnboundedReceiver<WriterCommand>>>,
    writer: StdMutex<Option<W>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl<W> Sender<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W, variant: FramingVariant) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            variant,
            tx,
            rx: StdMutex::new(Some(rx)),
            writer: StdMutex::new(Some(writer)),
            task: AsyncMutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Spawns the background writer task. May only be called once. `fault_tx`
    /// receives the write error if the underlying writer ever fails, so the
    /// caller can surface it as a connection fault and begin tearing down.
    pub async fn connect(&self, fault_tx: mpsc::UnboundedSender<ConnectionError>) -> Result<(), ConnectionError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let writer = self
            .writer
            .lock()
            .unwrap()
            .take()
            .expect("writer taken exactly once, guarded by `connected`");
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("receiver taken exactly once, guarded by `connected`");
        let variant = self.variant;
        let handle = tokio::spawn(writer_task(writer, rx, variant, fault_tx));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Enqueues a frame for the background writer. Never blocks on I/O.
    pub fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ClosedForSend);
        }
        self.tx
            .send(WriterCommand::Send(message))
            .map_err(|_| ConnectionError::ClosedForSend)
    }

    /// Marks the outbound queue complete and waits for every already-queued
    /// frame to be written before the underlying writer is shut down.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(WriterCommand::Shutdown);
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    variant: FramingVariant,
    fault_tx: mpsc::UnboundedSender<ConnectionError>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(message) => {
                if let Err(err) = codec::write_message(&mut writer, &message, variant).await {
                    tracing::warn!(error = %err, "failed to write outbound frame, dropping writer task");
                    let _ = fault_tx.send(err);
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    use tokio::io::AsyncWriteExt;
    let _ = writer.shutdown().await;
}
