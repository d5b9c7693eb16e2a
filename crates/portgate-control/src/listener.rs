//! Public listeners for stream tunnels and the per-connection pumps
//!
//! A TCP listener accepts public sockets, registers each as a connection
//! and spawns one pump that reads the socket into binary frames. A UDP
//! listener is a single socket whose peers become connections keyed by
//! their `ip:port`.

use crate::connection::Connection;
use crate::registry::RegistryError;
use crate::tunnel::Tunnel;
use portgate_proto::{TunnelType, WsTunnelMessage};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// A running listener owned by one tunnel
pub struct ListenerHandle {
    pub kind: TunnelType,
    pub port: u16,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// True while the accept/receive loop is alive
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Take the error that ended the loop, if any
    pub fn take_failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Stop the loop and wait until the socket is released
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Settings for the read side of pumps
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub tcp_buffer_size: usize,
    pub udp_buffer_size: usize,
    /// UDP peers without traffic for this long are dropped
    pub udp_idle_timeout: Duration,
}

/// Bind a TCP listener for `tunnel` and start its accept loop
pub async fn spawn_tcp(
    tunnel: Arc<Tunnel>,
    host: IpAddr,
    desired_port: Option<u16>,
    pump: PumpConfig,
) -> Result<ListenerHandle, RegistryError> {
    let listener = bind_tcp(host, desired_port).await?;
    let port = listener.local_addr()?.port();

    info!(
        "TCP listener for tunnel {} bound on {}:{}",
        tunnel.id(),
        host,
        port
    );

    let cancel = CancellationToken::new();
    let failure = Arc::new(Mutex::new(None));
    let task = tokio::spawn(accept_loop(
        tunnel,
        listener,
        cancel.clone(),
        failure.clone(),
        pump.tcp_buffer_size,
    ));

    Ok(ListenerHandle {
        kind: TunnelType::Tcp,
        port,
        cancel,
        failure,
        task,
    })
}

/// Bind a UDP socket for `tunnel` and start its receive loop
pub async fn spawn_udp(
    tunnel: Arc<Tunnel>,
    host: IpAddr,
    desired_port: Option<u16>,
    pump: PumpConfig,
) -> Result<ListenerHandle, RegistryError> {
    let socket = Arc::new(bind_udp(host, desired_port).await?);
    let port = socket.local_addr()?.port();

    info!(
        "UDP socket for tunnel {} bound on {}:{}",
        tunnel.id(),
        host,
        port
    );

    let cancel = CancellationToken::new();
    let failure = Arc::new(Mutex::new(None));
    let task = tokio::spawn(receive_loop(
        tunnel,
        socket,
        cancel.clone(),
        failure.clone(),
        pump,
    ));

    Ok(ListenerHandle {
        kind: TunnelType::Udp,
        port,
        cancel,
        failure,
        task,
    })
}

async fn bind_tcp(host: IpAddr, desired_port: Option<u16>) -> Result<TcpListener, RegistryError> {
    if let Some(port) = desired_port.filter(|p| *p != 0) {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => warn!(
                "Desired TCP port {} unavailable ({}), using an ephemeral port",
                port, e
            ),
        }
    }

    TcpListener::bind((host, 0))
        .await
        .map_err(|e| RegistryError::Bind {
            address: host.to_string(),
            port: 0,
            reason: e.to_string(),
        })
}

async fn bind_udp(host: IpAddr, desired_port: Option<u16>) -> Result<UdpSocket, RegistryError> {
    if let Some(port) = desired_port.filter(|p| *p != 0) {
        match UdpSocket::bind((host, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => warn!(
                "Desired UDP port {} unavailable ({}), using an ephemeral port",
                port, e
            ),
        }
    }

    UdpSocket::bind((host, 0))
        .await
        .map_err(|e| RegistryError::Bind {
            address: host.to_string(),
            port: 0,
            reason: e.to_string(),
        })
}

async fn accept_loop(
    tunnel: Arc<Tunnel>,
    listener: TcpListener,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
    buffer_size: usize,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed on tunnel {}: {}", tunnel.id(), e);
                *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                break;
            }
        };

        // An unattached tunnel has nowhere to relay, so refuse right away
        let Some(channel) = tunnel.current_channel() else {
            debug!(
                "Tunnel {} has no control channel, closing connection from {}",
                tunnel.id(),
                peer_addr
            );
            drop(stream);
            continue;
        };

        let connection_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "New TCP connection {} from {} on tunnel {}",
            connection_id,
            peer_addr,
            tunnel.id()
        );

        let (reader, writer) = stream.into_split();
        let connection_cancel = CancellationToken::new();
        tunnel.insert_connection(Connection::tcp(
            connection_id.clone(),
            writer,
            connection_cancel.clone(),
        ));

        if let Err(e) = channel
            .send_message(WsTunnelMessage::open(connection_id.clone(), None, None, None))
            .await
        {
            debug!("Failed to send OPEN for {}: {}", connection_id, e);
        }

        tokio::spawn(pump_tcp(
            tunnel.clone(),
            connection_id,
            reader,
            connection_cancel,
            buffer_size,
        ));
    }

    debug!("Accept loop for tunnel {} stopped", tunnel.id());
}

enum PumpExit {
    Eof,
    Error(std::io::Error),
    Cancelled,
}

/// Relay one public socket into frames until EOF, error or cancellation
async fn pump_tcp(
    tunnel: Arc<Tunnel>,
    connection_id: String,
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    let exit = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => break PumpExit::Eof,
            Ok(n) => tunnel.send_frame(&connection_id, &buffer[..n]).await,
            Err(e) => break PumpExit::Error(e),
        }
    };

    match exit {
        // whoever cancelled already removed the connection
        PumpExit::Cancelled => {
            debug!("Pump for {} cancelled", connection_id);
            return;
        }
        PumpExit::Eof => debug!("Connection {} closed by public peer", connection_id),
        PumpExit::Error(e) => debug!("Read error on connection {}: {}", connection_id, e),
    }

    if let Some(connection) = tunnel.remove_connection(&connection_id) {
        connection.shutdown(None, None).await;
        tunnel
            .send_message(WsTunnelMessage::close(connection_id, None, None))
            .await;
    }
}

async fn receive_loop(
    tunnel: Arc<Tunnel>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
    pump: PumpConfig,
) {
    let mut buffer = vec![0u8; pump.udp_buffer_size];
    let idle_timeout = pump.udp_idle_timeout;
    let mut sweep = tokio::time::interval((idle_timeout / 2).max(MIN_SWEEP_INTERVAL));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                expire_idle_peers(&tunnel, idle_timeout).await;
                continue;
            }
            received = socket.recv_from(&mut buffer) => received,
        };

        let (n, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                error!("UDP receive failed on tunnel {}: {}", tunnel.id(), e);
                *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                break;
            }
        };

        if !tunnel.is_attached() {
            debug!(
                "Tunnel {} has no control channel, dropping datagram from {}",
                tunnel.id(),
                peer
            );
            continue;
        }

        let connection_id = udp_connection_id(&peer);
        tunnel
            .connection_or_insert_with(&connection_id, || {
                debug!("New UDP peer {} on tunnel {}", peer, tunnel.id());
                Connection::udp(connection_id.clone(), socket.clone(), peer)
            })
            .touch();
        tunnel.send_frame(&connection_id, &buffer[..n]).await;
    }

    debug!("Receive loop for tunnel {} stopped", tunnel.id());
}

/// Drop idle UDP peers and tell the client each one is gone
async fn expire_idle_peers(tunnel: &Tunnel, idle_timeout: Duration) {
    for connection in tunnel.remove_idle_udp(idle_timeout) {
        debug!(
            "UDP peer {} on tunnel {} idle, removing",
            connection.id(),
            tunnel.id()
        );
        tunnel
            .send_message(WsTunnelMessage::close(connection.id(), None, None))
            .await;
    }
}

/// Connection id of a UDP peer
pub fn udp_connection_id(peer: &SocketAddr) -> String {
    peer.to_string()
}
