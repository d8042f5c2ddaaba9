//! Framed transport to the coordination service.
//!
//! One duplex connection carries tagged frames: requests and their replies in
//! strict FIFO order, interleaved with unsolicited event frames. A background
//! reader task demultiplexes the two streams so a caller blocked on a reply
//! never starves event delivery.

use crate::server::protocol::{
    self, FRAME_EVENT, FRAME_REPLY, FRAME_REQUEST, MAX_MESSAGE_SIZE, ProtocolError, ServerEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection to coordination service closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Request/reply plus event delivery. Object-safe so tests can substitute a
/// scripted implementation.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one request frame and wait for its reply frame.
    async fn round_trip(&self, frame: Bytes) -> Result<Bytes, TransportError>;

    /// Next unsolicited event, or `None` once the connection is gone.
    async fn next_event(&self) -> Option<ServerEvent>;
}

/// Production transport over a unix-domain socket.
pub struct UnixSocketTransport {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Reply waiters, FIFO — replies come back in request order.
    waiters: Arc<Mutex<VecDeque<oneshot::Sender<Bytes>>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl UnixSocketTransport {
    pub async fn connect(path: &Path) -> Result<Arc<UnixSocketTransport>, TransportError> {
        let stream = UnixStream::connect(path).await?;
        let (read, writer) = stream.into_split();
        let waiters: Arc<Mutex<VecDeque<oneshot::Sender<Bytes>>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_waiters = waiters.clone();
        tokio::spawn(async move {
            if let Err(err) = read_loop(read, reader_waiters.clone(), event_tx).await {
                debug!(error = %err, "transport reader stopped");
            }
            // Dropping the senders fails every in-flight round trip.
            reader_waiters.lock().unwrap_or_else(|e| e.into_inner()).clear();
        });

        Ok(Arc::new(UnixSocketTransport {
            writer: tokio::sync::Mutex::new(writer),
            waiters,
            events: tokio::sync::Mutex::new(event_rx),
        }))
    }
}

async fn read_loop(
    mut read: OwnedReadHalf,
    waiters: Arc<Mutex<VecDeque<oneshot::Sender<Bytes>>>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) -> Result<(), TransportError> {
    loop {
        let tag = read.read_u8().await?;
        let len = read.read_u32_le().await? as usize;
        if len > MAX_MESSAGE_SIZE {
            warn!(len, "oversized frame from service");
            return Err(ProtocolError::TooLarge(len).into());
        }
        let mut payload = vec![0u8; len];
        read.read_exact(&mut payload).await?;
        match tag {
            FRAME_REPLY => {
                let waiter = waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Bytes::from(payload));
                    }
                    None => warn!("reply frame with no outstanding request"),
                }
            }
            FRAME_EVENT => {
                let event = protocol::decode_event(&payload)?;
                if event_tx.send(event).is_err() {
                    return Ok(());
                }
            }
            other => {
                warn!(tag = other, "unknown frame tag from service");
                return Err(ProtocolError::Truncated.into());
            }
        }
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn round_trip(&self, frame: Bytes) -> Result<Bytes, TransportError> {
        let (tx, rx) = oneshot::channel();
        {
            // Registration and the write happen under the writer lock so the
            // waiter queue order matches the wire order.
            let mut writer = self.writer.lock().await;
            self.waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(tx);
            writer.write_u8(FRAME_REQUEST).await?;
            writer.write_u32_le(frame.len() as u32).await?;
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn next_event(&self) -> Option<ServerEvent> {
        self.events.lock().await.recv().await
    }
}
