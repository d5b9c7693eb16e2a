//! Tunnel registry
//!
//! Per-instance table of live tunnels. Owns every tunnel's listener, its
//! control channel attachment and its connection map, and is the only
//! entry point for exposing tunnels and routing frames in either direction.
//!
//! Shared maps are [`DashMap`]s; handles are cloned out of them before any
//! await so no map guard is ever held across a suspension point.

use crate::channel::{ChannelError, ControlChannel};
use crate::connection::{Connection, StreamEvent};
use crate::listener::{self, PumpConfig};
use crate::pending_requests::PendingRequests;
use crate::tunnel::Tunnel;
use bytes::Bytes;
use dashmap::DashMap;
use portgate_proto::{
    frame, ExposeRequest, ExposeResponse, Headers, HttpTunnelMessage, TunnelType, WsTunnelMessage,
    WsType,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// WebSocket close code used when the tunnel client reports an error
const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Listener for tunnel {tunnel_id} failed: {reason}")]
    ListenerFailed { tunnel_id: String, reason: String },

    #[error("Tunnel {tunnel_id} is already exposed as {existing}, not {requested}")]
    TypeMismatch {
        tunnel_id: String,
        existing: TunnelType,
        requested: TunnelType,
    },

    #[error("{0} tunnels have no listener")]
    NotStreamType(TunnelType),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Tunnel {0} has no control channel attached")]
    NotAttached(String),

    #[error("Registry is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("No tunnel for subdomain {0}")]
    TunnelNotFound(String),

    #[error("Tunnel {0} has no control channel attached")]
    NotAttached(String),

    #[error("Control channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Address public listeners bind on
    pub listen_host: IpAddr,
    /// Host advertised to clients for stream tunnels
    pub public_host: String,
    /// Base domain HTTP tunnels are served under
    pub base_domain: String,
    /// Outbound buffer of each control channel
    pub channel_buffer: usize,
    /// How long an HTTP request waits for the client's response
    pub forward_timeout: Duration,
    pub tcp_buffer_size: usize,
    pub udp_buffer_size: usize,
    /// UDP peers without traffic for this long are dropped
    pub udp_idle_timeout: Duration,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_host: "localhost".to_string(),
            base_domain: "localhost".to_string(),
            channel_buffer: 256,
            forward_timeout: Duration::from_secs(30),
            tcp_buffer_size: 8192,
            udp_buffer_size: 65535,
            udp_idle_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_listen_host(mut self, host: IpAddr) -> Self {
        self.listen_host = host;
        self
    }

    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = host.into();
        self
    }

    pub fn with_base_domain(mut self, domain: impl Into<String>) -> Self {
        self.base_domain = domain.into();
        self
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    pub fn with_channel_buffer(mut self, buffer: usize) -> Self {
        self.channel_buffer = buffer;
        self
    }

    fn pump(&self) -> PumpConfig {
        PumpConfig {
            tcp_buffer_size: self.tcp_buffer_size,
            udp_buffer_size: self.udp_buffer_size,
            udp_idle_timeout: self.udp_idle_timeout,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable registry state transitions
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    TunnelCreated {
        tunnel_id: String,
    },
    ChannelAttached {
        tunnel_id: String,
        channel_id: u64,
    },
    /// A newer attach displaced `previous`; the registry no longer routes to it
    ChannelReplaced {
        tunnel_id: String,
        previous: ControlChannel,
        channel_id: u64,
    },
    ChannelDetached {
        tunnel_id: String,
        channel_id: u64,
    },
    ListenerStarted {
        tunnel_id: String,
        kind: TunnelType,
        port: u16,
    },
    TunnelClosed {
        tunnel_id: String,
    },
}

/// Result of [`TunnelRegistry::attach_channel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Fresh,
    Replaced(ControlChannel),
}

/// A browser-side WebSocket relayed over a tunnel
pub struct StreamHandle {
    pub tunnel_id: String,
    pub connection_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
}

pub struct TunnelRegistry {
    config: RegistryConfig,
    tunnels: DashMap<String, Arc<Tunnel>>,
    /// subdomain -> tunnel id
    subdomains: DashMap<String, String>,
    /// custom domain -> subdomain
    custom_domains: DashMap<String, String>,
    pending: PendingRequests,
    events: broadcast::Sender<RegistryEvent>,
    shut_down: AtomicBool,
}

impl TunnelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            tunnels: DashMap::new(),
            subdomains: DashMap::new(),
            custom_domains: DashMap::new(),
            pending: PendingRequests::new(),
            events,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribe to attach/detach/listener events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(tunnel_id).map(|t| t.value().clone())
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn emit(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Atomic create-if-absent
    fn get_or_create(&self, tunnel_id: &str) -> Arc<Tunnel> {
        let mut created = false;
        let tunnel = self
            .tunnels
            .entry(tunnel_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Tunnel::new(tunnel_id))
            })
            .value()
            .clone();

        if created {
            debug!("Created tunnel {}", tunnel_id);
            self.emit(RegistryEvent::TunnelCreated {
                tunnel_id: tunnel_id.to_string(),
            });
        }
        tunnel
    }

    fn ensure_running(&self) -> Result<(), RegistryError> {
        if self.is_shut_down() {
            Err(RegistryError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Bind (or reuse) the public listener of a stream tunnel.
    ///
    /// Concurrent calls for the same tunnel serialize on the tunnel's
    /// listener slot, so exactly one listener is bound and every caller
    /// gets its port.
    pub async fn expose(
        &self,
        tunnel_id: &str,
        kind: TunnelType,
        desired_port: Option<u16>,
    ) -> Result<u16, RegistryError> {
        if !kind.is_stream() {
            return Err(RegistryError::NotStreamType(kind));
        }
        self.ensure_running()?;

        let tunnel = self.get_or_create(tunnel_id);
        let mut slot = tunnel.listener.lock().await;

        if let Some(existing) = slot.take() {
            if let Some(reason) = existing.take_failure() {
                warn!("Listener for tunnel {} had failed: {}", tunnel_id, reason);
                return Err(RegistryError::ListenerFailed {
                    tunnel_id: tunnel_id.to_string(),
                    reason,
                });
            }
            if existing.is_running() {
                let (existing_kind, port) = (existing.kind, existing.port);
                *slot = Some(existing);
                if existing_kind != kind {
                    return Err(RegistryError::TypeMismatch {
                        tunnel_id: tunnel_id.to_string(),
                        existing: existing_kind,
                        requested: kind,
                    });
                }
                return Ok(port);
            }
        }

        let host = self.config.listen_host;
        let handle = match kind {
            TunnelType::Tcp => {
                listener::spawn_tcp(tunnel.clone(), host, desired_port, self.config.pump()).await?
            }
            TunnelType::Udp => {
                listener::spawn_udp(tunnel.clone(), host, desired_port, self.config.pump()).await?
            }
            TunnelType::Http => return Err(RegistryError::NotStreamType(kind)),
        };

        let port = handle.port;
        *slot = Some(handle);
        drop(slot);

        info!("Exposed {} tunnel {} on port {}", kind, tunnel_id, port);
        self.emit(RegistryEvent::ListenerStarted {
            tunnel_id: tunnel_id.to_string(),
            kind,
            port,
        });
        Ok(port)
    }

    /// Handle an exposure API request for any tunnel type
    pub async fn expose_tunnel(
        &self,
        request: &ExposeRequest,
    ) -> Result<ExposeResponse, RegistryError> {
        if request.tunnel_type.is_stream() {
            let port = self
                .expose(&request.tunnel_id, request.tunnel_type, request.desired_port)
                .await?;
            return Ok(ExposeResponse {
                tunnel_id: request.tunnel_id.clone(),
                public_host: self.config.public_host.clone(),
                public_port: Some(port),
                public_url: None,
                subdomain: None,
            });
        }

        self.ensure_running()?;
        let subdomain =
            self.register_http_tunnel(&request.tunnel_id, request.subdomain.as_deref());

        let public_host = format!("{}.{}", subdomain, self.config.base_domain);
        Ok(ExposeResponse {
            tunnel_id: request.tunnel_id.clone(),
            public_url: Some(format!("https://{}", public_host)),
            public_host,
            public_port: None,
            subdomain: Some(subdomain),
        })
    }

    /// Register an HTTP tunnel and return its subdomain. Without an explicit
    /// subdomain an already-registered one is kept, otherwise one is derived
    /// from the tunnel id.
    pub fn register_http_tunnel(&self, tunnel_id: &str, subdomain: Option<&str>) -> String {
        let subdomain = subdomain
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .or_else(|| self.get(tunnel_id).and_then(|tunnel| tunnel.subdomain()))
            .unwrap_or_else(|| default_subdomain(tunnel_id));
        self.register_http(tunnel_id, &subdomain);
        subdomain
    }

    /// Route `subdomain` to an HTTP tunnel, creating the tunnel if needed
    pub fn register_http(&self, tunnel_id: &str, subdomain: &str) {
        let subdomain = subdomain.to_ascii_lowercase();
        let tunnel = self.get_or_create(tunnel_id);

        if let Some(previous) = tunnel.set_subdomain(Some(subdomain.clone())) {
            if previous != subdomain {
                self.subdomains
                    .remove_if(&previous, |_, owner| owner == tunnel_id);
            }
        }
        if let Some(displaced) = self.subdomains.insert(subdomain.clone(), tunnel_id.to_string()) {
            if displaced != tunnel_id {
                info!(
                    "Subdomain {} moved from tunnel {} to {}",
                    subdomain, displaced, tunnel_id
                );
            }
        }
        debug!("Registered subdomain {} for tunnel {}", subdomain, tunnel_id);
    }

    /// Map a customer domain onto a tunnel subdomain
    pub fn register_custom_domain(&self, domain: &str, subdomain: &str) {
        self.custom_domains
            .insert(domain.to_ascii_lowercase(), subdomain.to_ascii_lowercase());
    }

    pub fn tunnel_for_subdomain(&self, subdomain: &str) -> Option<String> {
        self.subdomains
            .get(&subdomain.to_ascii_lowercase())
            .map(|t| t.value().clone())
    }

    pub fn subdomain_for_custom_domain(&self, domain: &str) -> Option<String> {
        self.custom_domains
            .get(&domain.to_ascii_lowercase())
            .map(|s| s.value().clone())
    }

    /// True when this instance holds an attached tunnel for `subdomain`
    pub fn owns_subdomain(&self, subdomain: &str) -> bool {
        self.tunnel_for_subdomain(subdomain)
            .and_then(|id| self.get(&id))
            .is_some_and(|tunnel| tunnel.is_attached())
    }

    pub fn owns_custom_domain(&self, domain: &str) -> bool {
        self.subdomain_for_custom_domain(domain)
            .is_some_and(|subdomain| self.owns_subdomain(&subdomain))
    }

    /// Attach a control channel. The last attach wins; a displaced handle is
    /// returned and announced but left open for its owner to close.
    pub fn attach_channel(&self, tunnel_id: &str, channel: ControlChannel) -> Attachment {
        let tunnel = self.get_or_create(tunnel_id);
        let channel_id = channel.id();

        match tunnel.replace_channel(channel) {
            Some(previous) if previous.id() != channel_id => {
                info!(
                    "Control channel {} replaced {} on tunnel {}",
                    channel_id,
                    previous.id(),
                    tunnel_id
                );
                self.emit(RegistryEvent::ChannelReplaced {
                    tunnel_id: tunnel_id.to_string(),
                    previous: previous.clone(),
                    channel_id,
                });
                Attachment::Replaced(previous)
            }
            _ => {
                info!("Control channel {} attached to tunnel {}", channel_id, tunnel_id);
                self.emit(RegistryEvent::ChannelAttached {
                    tunnel_id: tunnel_id.to_string(),
                    channel_id,
                });
                Attachment::Fresh
            }
        }
    }

    /// Clear `channel` from whichever tunnel currently holds it.
    ///
    /// Connections stay open awaiting reattachment. Returns false when the
    /// handle was already replaced or never attached.
    pub fn detach_channel(&self, channel: &ControlChannel) -> bool {
        let detached: Vec<String> = self
            .tunnels
            .iter()
            .filter(|entry| entry.value().clear_channel_if(channel))
            .map(|entry| entry.key().clone())
            .collect();

        for tunnel_id in &detached {
            info!("Control channel {} detached from tunnel {}", channel.id(), tunnel_id);
            self.emit(RegistryEvent::ChannelDetached {
                tunnel_id: tunnel_id.clone(),
                channel_id: channel.id(),
            });
        }
        !detached.is_empty()
    }

    fn connection(&self, tunnel_id: &str, connection_id: &str) -> Option<(Arc<Tunnel>, Arc<Connection>)> {
        let tunnel = self.get(tunnel_id)?;
        let connection = tunnel.connection(connection_id)?;
        Some((tunnel, connection))
    }

    /// Write client bytes to a public connection. Unknown tunnels or
    /// connections drop the payload silently.
    pub async fn route_inbound_frame(&self, tunnel_id: &str, connection_id: &str, payload: &[u8]) {
        let Some((tunnel, connection)) = self.connection(tunnel_id, connection_id) else {
            debug!(
                "Dropping {} bytes for unknown connection {}/{}",
                payload.len(),
                tunnel_id,
                connection_id
            );
            return;
        };

        if let Err(e) = connection.write(payload).await {
            debug!("Write to connection {} failed: {}", connection_id, e);
            if let Some(connection) = tunnel.remove_connection(connection_id) {
                connection.shutdown(None, None).await;
                tunnel
                    .send_message(WsTunnelMessage::close(connection_id, None, None))
                    .await;
            }
        }
    }

    /// Decode one binary control-channel message and route it.
    /// Malformed frames are logged and dropped.
    pub async fn route_binary_message(&self, tunnel_id: &str, message: Bytes) {
        match frame::decode(message) {
            Ok(frame) if frame.payload.is_empty() => {
                debug!("Ignoring empty frame for {}", frame.connection_id);
            }
            Ok(frame) => {
                self.route_inbound_frame(tunnel_id, &frame.connection_id, &frame.payload)
                    .await
            }
            Err(e) => warn!("Dropping malformed frame on tunnel {}: {}", tunnel_id, e),
        }
    }

    /// Remove and close a connection; no-op when it is already gone
    pub async fn route_close(&self, tunnel_id: &str, connection_id: &str) {
        self.close_connection(tunnel_id, connection_id, None, None)
            .await;
    }

    async fn close_connection(
        &self,
        tunnel_id: &str,
        connection_id: &str,
        code: Option<u16>,
        reason: Option<String>,
    ) -> bool {
        let Some(tunnel) = self.get(tunnel_id) else {
            return false;
        };
        let Some(connection) = tunnel.remove_connection(connection_id) else {
            return false;
        };
        debug!("Closing connection {} on tunnel {}", connection_id, tunnel_id);
        connection.shutdown(code, reason).await;
        true
    }

    /// Route a WebSocket-kind message received from the tunnel client
    pub async fn route_ws_message(&self, tunnel_id: &str, message: WsTunnelMessage) {
        let Some(connection_id) = message.connection_id.clone() else {
            debug!("Ignoring {:?} without connection id", message.ws_type);
            return;
        };

        match message.ws_type {
            WsType::OpenOk => {
                debug!("Client confirmed connection {}", connection_id);
            }
            WsType::Binary => match message.data() {
                Ok(data) => self.route_inbound_frame(tunnel_id, &connection_id, &data).await,
                Err(e) => warn!("Dropping BINARY for {}: {}", connection_id, e),
            },
            WsType::Text => {
                let Some((_, connection)) = self.connection(tunnel_id, &connection_id) else {
                    debug!("Dropping TEXT for unknown connection {}", connection_id);
                    return;
                };
                if let Some(text) = message.text {
                    if let Err(e) = connection.write_text(text).await {
                        debug!("Write to connection {} failed: {}", connection_id, e);
                        self.route_close(tunnel_id, &connection_id).await;
                    }
                }
            }
            WsType::Close => {
                self.close_connection(
                    tunnel_id,
                    &connection_id,
                    message.close_code,
                    message.close_reason,
                )
                .await;
            }
            WsType::Error => {
                warn!(
                    "Client reported error on {}: {}",
                    connection_id,
                    message.close_reason.as_deref().unwrap_or("unknown")
                );
                self.close_connection(
                    tunnel_id,
                    &connection_id,
                    Some(CLOSE_INTERNAL_ERROR),
                    message.close_reason,
                )
                .await;
            }
            WsType::Open | WsType::Exposed => {
                debug!("Ignoring {:?} from client", message.ws_type);
            }
        }
    }

    /// Open a WebSocket-over-tunnel stream and announce it to the client
    pub async fn open_stream(
        &self,
        tunnel_id: &str,
        path: Option<String>,
        query: Option<String>,
        headers: Option<Headers>,
    ) -> Result<StreamHandle, RegistryError> {
        let tunnel = self
            .get(tunnel_id)
            .ok_or_else(|| RegistryError::TunnelNotFound(tunnel_id.to_string()))?;
        let channel = tunnel
            .current_channel()
            .ok_or_else(|| RegistryError::NotAttached(tunnel_id.to_string()))?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let (tx, events) = mpsc::channel(self.config.channel_buffer.max(1));
        tunnel.insert_connection(Connection::stream(connection_id.clone(), tx));

        let open = WsTunnelMessage::open(connection_id.clone(), path, query, headers);
        if let Err(e) = channel.send_message(open).await {
            debug!("Failed to send OPEN for stream {}: {}", connection_id, e);
            tunnel.remove_connection(&connection_id);
            return Err(RegistryError::NotAttached(tunnel_id.to_string()));
        }

        debug!("Opened stream {} on tunnel {}", connection_id, tunnel_id);
        Ok(StreamHandle {
            tunnel_id: tunnel_id.to_string(),
            connection_id,
            events,
        })
    }

    /// Relay a browser-side event to the tunnel client
    pub async fn send_stream_message(&self, tunnel_id: &str, message: WsTunnelMessage) {
        if let Some(tunnel) = self.get(tunnel_id) {
            tunnel.send_message(message).await;
        }
    }

    /// The browser side closed; drop the stream and tell the client
    pub async fn close_stream(
        &self,
        tunnel_id: &str,
        connection_id: &str,
        code: Option<u16>,
        reason: Option<String>,
    ) {
        let Some(tunnel) = self.get(tunnel_id) else {
            return;
        };
        if tunnel.remove_connection(connection_id).is_some() {
            tunnel
                .send_message(WsTunnelMessage::close(connection_id, code, reason))
                .await;
        }
    }

    /// Forward an HTTP request to the tunnel serving `subdomain` and wait
    /// for its response
    pub async fn forward_http(
        &self,
        subdomain: &str,
        mut request: HttpTunnelMessage,
    ) -> Result<HttpTunnelMessage, ForwardError> {
        let tunnel_id = self
            .tunnel_for_subdomain(subdomain)
            .ok_or_else(|| ForwardError::TunnelNotFound(subdomain.to_string()))?;
        let channel = self
            .get(&tunnel_id)
            .and_then(|tunnel| tunnel.current_channel())
            .ok_or_else(|| ForwardError::NotAttached(tunnel_id.clone()))?;

        request.id = uuid::Uuid::new_v4().to_string();
        let request_id = request.id.clone();
        let response = self.pending.register(request_id.clone());

        if let Err(e) = channel.send_message(request).await {
            self.pending.cancel(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.forward_timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ForwardError::Cancelled),
            Err(_) => {
                self.pending.cancel(&request_id);
                Err(ForwardError::Timeout(self.config.forward_timeout))
            }
        }
    }

    /// Complete a forwarded request with the client's RESPONSE
    pub fn on_http_response(&self, response: HttpTunnelMessage) -> bool {
        self.pending.respond(response)
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.count()
    }

    /// Stop a tunnel's listener, close its connections and forget it
    pub async fn close_tunnel(&self, tunnel_id: &str) {
        let Some((_, tunnel)) = self.tunnels.remove(tunnel_id) else {
            return;
        };
        self.teardown(&tunnel).await;
        info!("Closed tunnel {}", tunnel_id);
        self.emit(RegistryEvent::TunnelClosed {
            tunnel_id: tunnel_id.to_string(),
        });
    }

    async fn teardown(&self, tunnel: &Tunnel) {
        if let Some(listener) = tunnel.listener.lock().await.take() {
            listener.stop().await;
        }
        for connection in tunnel.drain_connections() {
            connection.shutdown(None, None).await;
        }
        if let Some(subdomain) = tunnel.set_subdomain(None) {
            self.subdomains
                .remove_if(&subdomain, |_, owner| owner == tunnel.id());
        }
        tunnel.clear_channel();
    }

    /// Close every listener, connection and pending request. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down tunnel registry");

        let tunnel_ids: Vec<String> = self.tunnels.iter().map(|t| t.key().clone()).collect();
        for tunnel_id in tunnel_ids {
            self.close_tunnel(&tunnel_id).await;
        }
        self.pending.cancel_all();
        self.custom_domains.clear();
    }
}

/// Subdomain used when an HTTP tunnel names none
pub fn default_subdomain(tunnel_id: &str) -> String {
    tunnel_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect::<String>()
        .to_ascii_lowercase()
}
