//! Control channel handles
//!
//! A [`ControlChannel`] is the registry's view of one client's control
//! connection. The transport (a WebSocket session in the relay) owns the
//! receiving half and writes every [`ChannelMessage`] to the wire in order.

use bytes::Bytes;
use portgate_proto::{frame, FrameError, MessageError, TunnelMessage};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One outbound message on a control channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Control channel closed")]
    Closed,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),
}

/// Cloneable handle to a client's control connection.
///
/// Two handles are equal only if they were cloned from the same
/// [`ControlChannel::new`] call.
#[derive(Clone)]
pub struct ControlChannel {
    id: u64,
    tx: mpsc::Sender<ChannelMessage>,
    closed: CancellationToken,
}

impl ControlChannel {
    /// Create a handle and the receiver the transport drains
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ChannelMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let channel = Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closed: CancellationToken::new(),
        };
        (channel, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.tx.send(message).await.map_err(|_| ChannelError::Closed)
    }

    /// Send one binary tunnel frame
    pub async fn send_frame(&self, connection_id: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let bytes = frame::encode(connection_id, payload)?;
        self.send(ChannelMessage::Binary(bytes)).await
    }

    /// Send a JSON text message
    pub async fn send_message(&self, message: impl Into<TunnelMessage>) -> Result<(), ChannelError> {
        let json = message.into().to_json()?;
        self.send(ChannelMessage::Text(json)).await
    }

    /// Mark the channel closed; the transport watching [`closed`](Self::closed) ends the session
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl PartialEq for ControlChannel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ControlChannel {}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
