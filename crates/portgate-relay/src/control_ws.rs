//! Control-channel WebSocket endpoints
//!
//! One WebSocket per tunnel client. Outbound traffic is queued on a
//! [`ControlChannel`] and drained by a writer task; inbound text messages
//! are dispatched on their `kind`, binary messages are tunnel frames.

use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use portgate_control::{Attachment, ChannelMessage, ControlChannel};
use portgate_proto::{
    ControlMessage, ControlType, HttpMessageType, TunnelMessage, TunnelType, WsTunnelMessage,
};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct StreamTunnelParams {
    #[serde(rename = "type")]
    pub tunnel_type: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct HttpTunnelParams {
    pub subdomain: Option<String>,
}

/// What a session sets up before attaching its channel
enum SessionKind {
    Stream {
        kind: TunnelType,
        desired_port: Option<u16>,
    },
    Http {
        subdomain: Option<String>,
    },
}

/// `GET /api/net-proxy/tunnel/{tunnel_id}?type=tcp|udp&port=N`
pub async fn stream_tunnel(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    Query(params): Query<StreamTunnelParams>,
    State(state): State<AppState>,
) -> Response {
    let kind = match params.tunnel_type.as_deref().unwrap_or("tcp").parse::<TunnelType>() {
        Ok(kind) if kind.is_stream() => kind,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                "type must be tcp or udp".to_string(),
            )
                .into_response()
        }
    };

    let session = SessionKind::Stream {
        kind,
        desired_port: params.port.filter(|port| *port != 0),
    };
    ws.on_upgrade(move |socket| run_session(state, tunnel_id, session, socket))
}

/// `GET /api/tunnel/{tunnel_id}?subdomain=...`
pub async fn http_tunnel(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    Query(params): Query<HttpTunnelParams>,
    State(state): State<AppState>,
) -> Response {
    let session = SessionKind::Http {
        subdomain: params.subdomain,
    };
    ws.on_upgrade(move |socket| run_session(state, tunnel_id, session, socket))
}

fn to_ws_message(message: ChannelMessage) -> Message {
    match message {
        ChannelMessage::Text(text) => Message::Text(text.into()),
        ChannelMessage::Binary(data) => Message::Binary(data),
    }
}

/// Drain the channel into the socket until the channel closes
fn spawn_writer(
    channel: ControlChannel,
    mut outbound: tokio::sync::mpsc::Receiver<ChannelMessage>,
    mut sink: SplitSink<WebSocket, Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = channel.closed() => break,
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = sink.send(to_ws_message(message)).await {
                        debug!("Control channel {} write failed: {}", channel.id(), e);
                        channel.close();
                        return;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    })
}

async fn run_session(state: AppState, tunnel_id: String, session: SessionKind, socket: WebSocket) {
    let registry = state.registry.clone();
    let (mut sink, mut stream) = socket.split();

    let exposed = match &session {
        SessionKind::Stream { kind, desired_port } => {
            match registry.expose(&tunnel_id, *kind, *desired_port).await {
                Ok(port) => Some(port),
                Err(e) => {
                    warn!("Failed to expose tunnel {}: {}", tunnel_id, e);
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_INTERNAL_ERROR,
                            reason: e.to_string().into(),
                        })))
                        .await;
                    return;
                }
            }
        }
        SessionKind::Http { subdomain } => {
            let subdomain = registry.register_http_tunnel(&tunnel_id, subdomain.as_deref());
            info!("HTTP tunnel {} serves subdomain {}", tunnel_id, subdomain);
            None
        }
    };

    let (channel, outbound) = ControlChannel::new(registry.config().channel_buffer);
    let writer = spawn_writer(channel.clone(), outbound, sink);

    if let Attachment::Replaced(previous) = registry.attach_channel(&tunnel_id, channel.clone()) {
        previous.close();
    }

    if let Some(port) = exposed {
        let public_host = registry.config().public_host.clone();
        if let Err(e) = channel
            .send_message(WsTunnelMessage::exposed(&public_host, port))
            .await
        {
            debug!("Failed to send EXPOSED on tunnel {}: {}", tunnel_id, e);
        }
        info!("Tunnel {} exposed at {}:{}", tunnel_id, public_host, port);
    }

    loop {
        let message = tokio::select! {
            _ = channel.closed() => {
                debug!("Control channel {} closed locally", channel.id());
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                handle_text(&state, &tunnel_id, &channel, text.as_str()).await
            }
            Some(Ok(Message::Binary(data))) => {
                registry.route_binary_message(&tunnel_id, data).await
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Control channel {} read failed: {}", channel.id(), e);
                break;
            }
        }
    }

    registry.detach_channel(&channel);
    channel.close();
    let _ = writer.await;
    info!("Control channel {} for tunnel {} ended", channel.id(), tunnel_id);
}

async fn handle_text(state: &AppState, tunnel_id: &str, channel: &ControlChannel, text: &str) {
    let message = match TunnelMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping malformed message on tunnel {}: {}", tunnel_id, e);
            return;
        }
    };

    match message {
        TunnelMessage::Control(control) => {
            if control.control_type == ControlType::Ping {
                let ts = control
                    .ts
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                let pong = ControlMessage::pong(ts);
                if let Err(e) = channel.send_message(pong).await {
                    debug!("Failed to answer ping on tunnel {}: {}", tunnel_id, e);
                }
            }
        }
        TunnelMessage::Ws(ws) => state.registry.route_ws_message(tunnel_id, ws).await,
        TunnelMessage::Http(http) => {
            if http.message_type != HttpMessageType::Response {
                debug!("Ignoring HTTP {:?} from client", http.message_type);
                return;
            }
            let id = http.id.clone();
            if !state.registry.on_http_response(http) {
                debug!("No pending request {} on tunnel {}", id, tunnel_id);
            }
        }
    }
}
