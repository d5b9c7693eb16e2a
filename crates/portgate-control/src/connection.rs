//! Logical connections multiplexed over a tunnel
//!
//! A connection only holds the write side of its public socket and a
//! cancellation token for its pump. The read side lives in the pump task.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a close waits for room in a stream's event buffer
const CLOSE_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Event delivered to a streaming (WebSocket-over-tunnel) connection
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Binary(Bytes),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Where inbound bytes for a connection are written
pub enum ConnectionSink {
    Tcp(Mutex<OwnedWriteHalf>),
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    Stream(mpsc::Sender<StreamEvent>),
}

pub struct Connection {
    id: String,
    sink: ConnectionSink,
    cancel: CancellationToken,
    last_active: std::sync::Mutex<Instant>,
}

impl Connection {
    pub fn tcp(id: impl Into<String>, writer: OwnedWriteHalf, cancel: CancellationToken) -> Self {
        Self {
            id: id.into(),
            sink: ConnectionSink::Tcp(Mutex::new(writer)),
            cancel,
            last_active: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn udp(id: impl Into<String>, socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            id: id.into(),
            sink: ConnectionSink::Udp { socket, peer },
            cancel: CancellationToken::new(),
            last_active: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn stream(id: impl Into<String>, events: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            id: id.into(),
            sink: ConnectionSink::Stream(events),
            cancel: CancellationToken::new(),
            last_active: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.sink, ConnectionSink::Stream(_))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.sink, ConnectionSink::Udp { .. })
    }

    /// Record traffic in either direction
    pub fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    /// Time since the last recorded traffic
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    /// Write payload bytes to the public side
    pub async fn write(&self, payload: &[u8]) -> io::Result<()> {
        self.touch();
        match &self.sink {
            ConnectionSink::Tcp(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(payload).await?;
                writer.flush().await
            }
            ConnectionSink::Udp { socket, peer } => socket.send_to(payload, peer).await.map(|_| ()),
            ConnectionSink::Stream(events) => events
                .send(StreamEvent::Binary(Bytes::copy_from_slice(payload)))
                .await
                .map_err(|_| stream_closed()),
        }
    }

    /// Deliver a text payload. Socket sinks receive its UTF-8 bytes.
    pub async fn write_text(&self, text: String) -> io::Result<()> {
        match &self.sink {
            ConnectionSink::Stream(events) => events
                .send(StreamEvent::Text(text))
                .await
                .map_err(|_| stream_closed()),
            _ => self.write(text.as_bytes()).await,
        }
    }

    /// Stop the pump and close the public side
    pub async fn shutdown(&self, code: Option<u16>, reason: Option<String>) {
        self.cancel.cancel();
        match &self.sink {
            ConnectionSink::Tcp(writer) => {
                let _ = writer.lock().await.shutdown().await;
            }
            ConnectionSink::Udp { .. } => {}
            ConnectionSink::Stream(events) => {
                let close = events.send(StreamEvent::Close { code, reason });
                if timeout(CLOSE_DELIVERY_TIMEOUT, close).await.is_err() {
                    debug!("Close for stream {} not delivered, buffer full", self.id);
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}
