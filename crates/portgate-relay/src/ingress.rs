//! Public HTTP ingress on a relay instance
//!
//! Requests that match no API route are addressed to a tunnel by host
//! (tenant subdomain or configured custom domain) or by a `/_/{subdomain}/`
//! path prefix. Plain requests travel as HTTP REQUEST messages; WebSocket
//! upgrades become stream connections over the tunnel.

use crate::state::AppState;
use axum::body::{to_bytes, Body};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, COOKIE, HOST, UPGRADE,
};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use portgate_control::{ForwardError, RegistryError, StreamEvent, StreamHandle, TunnelRegistry};
use portgate_proto::{Headers, HttpTunnelMessage, WsTunnelMessage};
use portgate_router::headers::{is_hop_by_hop, strip_hop_by_hop};
use portgate_router::host::{normalize_host, subdomain_of};
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest request body relayed over a tunnel
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Path prefixes addressing a tunnel without a tenant host name
const PATH_PREFIXES: [&str; 2] = ["/_/", "/_ws/"];

/// Where an ingress request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressTarget {
    pub subdomain: String,
    /// Path as the tunnel client should see it
    pub path: String,
}

/// Host the client addressed: `X-Forwarded-Host` (first entry) or `Host`
pub fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(X_FORWARDED_HOST)
        .or_else(|| headers.get(HOST))
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.host())
        .and_then(normalize_host)
}

fn split_prefixed_path(path: &str) -> Option<(String, String)> {
    let rest = PATH_PREFIXES
        .iter()
        .find_map(|prefix| path.strip_prefix(prefix))?;
    let (subdomain, remainder) = match rest.split_once('/') {
        Some((subdomain, remainder)) => (subdomain, format!("/{}", remainder)),
        None => (rest, "/".to_string()),
    };
    if subdomain.is_empty() {
        return None;
    }
    Some((subdomain.to_ascii_lowercase(), remainder))
}

/// Resolve the tunnel subdomain for a request.
///
/// Host-based addressing wins when it names a registered tunnel; the path
/// prefix is tried next, and an unregistered host subdomain last.
pub fn resolve_target(
    registry: &TunnelRegistry,
    headers: &HeaderMap,
    uri: &Uri,
) -> Option<IngressTarget> {
    let path = uri.path();
    let base_domain = &registry.config().base_domain;

    let host_subdomain = request_host(headers, uri).and_then(|host| {
        subdomain_of(&host, base_domain).or_else(|| registry.subdomain_for_custom_domain(&host))
    });

    if let Some(subdomain) = &host_subdomain {
        if registry.tunnel_for_subdomain(subdomain).is_some() {
            return Some(IngressTarget {
                subdomain: subdomain.clone(),
                path: path.to_string(),
            });
        }
    }

    if let Some((subdomain, path)) = split_prefixed_path(path) {
        return Some(IngressTarget { subdomain, path });
    }

    host_subdomain.map(|subdomain| IngressTarget {
        subdomain,
        path: path.to_string(),
    })
}

/// Flatten headers for the wire, dropping hop-by-hop ones
pub fn to_wire_headers(headers: &HeaderMap) -> Headers {
    let mut wire = Headers::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        // Cookie pairs are joined with "; ", every other list with ", "
        let separator = if *name == COOKIE { "; " } else { ", " };
        wire.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(separator);
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    wire
}

fn from_wire_headers(wire: &Headers) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in wire {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    strip_hop_by_hop(&mut headers);
    headers.remove(CONTENT_LENGTH);
    headers
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

/// Fallback handler for everything that is not an API route
pub async fn ingress(State(state): State<AppState>, request: Request) -> Response {
    let Some(target) = resolve_target(&state.registry, request.headers(), request.uri()) else {
        return error_response(StatusCode::NOT_FOUND, "No tunnel for this host");
    };

    if is_websocket_upgrade(request.headers()) {
        return open_websocket(state, target, request).await;
    }
    forward_request(state, target, request).await
}

async fn forward_request(state: AppState, target: IngressTarget, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            debug!("Rejecting request body for {}: {}", target.subdomain, e);
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    let message = HttpTunnelMessage::request(
        "",
        parts.method.as_str(),
        target.path.clone(),
        parts.uri.query().map(str::to_string),
        to_wire_headers(&parts.headers),
        &body,
    );

    let response = match state.registry.forward_http(&target.subdomain, message).await {
        Ok(response) => response,
        Err(e) => return forward_error_response(&target.subdomain, e),
    };

    let status = response
        .status
        .and_then(|status| StatusCode::from_u16(status).ok())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match response.response_body() {
        Ok(body) => body,
        Err(e) => {
            warn!("Invalid response body from tunnel {}: {}", target.subdomain, e);
            return error_response(StatusCode::BAD_GATEWAY, "Invalid response from tunnel");
        }
    };

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        if let Some(wire) = &response.resp_headers {
            *headers = from_wire_headers(wire);
        }
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "Invalid response from tunnel"))
}

fn forward_error_response(subdomain: &str, error: ForwardError) -> Response {
    let status = match &error {
        ForwardError::TunnelNotFound(_) => StatusCode::NOT_FOUND,
        ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ForwardError::NotAttached(_) | ForwardError::Channel(_) | ForwardError::Cancelled => {
            StatusCode::BAD_GATEWAY
        }
    };
    debug!("Forward to {} failed: {}", subdomain, error);
    error_response(status, error.to_string())
}

/// Headers passed to the client's local WebSocket dial
fn stream_open_headers(headers: &HeaderMap) -> Headers {
    let mut wire = to_wire_headers(headers);
    wire.retain(|name, _| {
        !matches!(
            name.as_str(),
            "sec-websocket-key" | "sec-websocket-version" | "sec-websocket-extensions"
        )
    });
    wire
}

async fn open_websocket(state: AppState, target: IngressTarget, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let registry = state.registry.clone();
    let Some(tunnel_id) = registry.tunnel_for_subdomain(&target.subdomain) else {
        return error_response(StatusCode::NOT_FOUND, "No tunnel for this host");
    };

    let handle = match registry
        .open_stream(
            &tunnel_id,
            Some(target.path),
            parts.uri.query().map(str::to_string),
            Some(stream_open_headers(&parts.headers)),
        )
        .await
    {
        Ok(handle) => handle,
        Err(RegistryError::TunnelNotFound(_)) => {
            return error_response(StatusCode::NOT_FOUND, "No tunnel for this host")
        }
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    };

    let (tunnel_id, connection_id) = (handle.tunnel_id.clone(), handle.connection_id.clone());
    let failed_registry = registry.clone();
    ws.on_failed_upgrade(move |e| {
        debug!("WebSocket upgrade for {} failed: {}", connection_id, e);
        tokio::spawn(async move {
            failed_registry
                .close_stream(&tunnel_id, &connection_id, None, None)
                .await;
        });
    })
    .on_upgrade(move |socket| bridge_stream(registry, handle, socket))
}

/// Relay between a browser WebSocket and its tunnel stream
async fn bridge_stream(registry: Arc<TunnelRegistry>, handle: StreamHandle, socket: WebSocket) {
    let StreamHandle {
        tunnel_id,
        connection_id,
        mut events,
    } = handle;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let outbound = match event {
                    Some(StreamEvent::Text(text)) => Message::Text(text.into()),
                    Some(StreamEvent::Binary(data)) => Message::Binary(data),
                    Some(StreamEvent::Close { code, reason }) => {
                        let frame = code.map(|code| CloseFrame {
                            code,
                            reason: reason.unwrap_or_default().into(),
                        });
                        let _ = sink.send(Message::Close(frame)).await;
                        break;
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sink.send(outbound).await.is_err() {
                    registry.close_stream(&tunnel_id, &connection_id, None, None).await;
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    registry
                        .send_stream_message(&tunnel_id, WsTunnelMessage::text(&connection_id, text.as_str()))
                        .await
                }
                Some(Ok(Message::Binary(data))) => {
                    registry
                        .send_stream_message(&tunnel_id, WsTunnelMessage::binary(&connection_id, &data))
                        .await
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(frame.code), Some(frame.reason.as_str().to_string())),
                        None => (None, None),
                    };
                    registry.close_stream(&tunnel_id, &connection_id, code, reason).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    registry.close_stream(&tunnel_id, &connection_id, None, None).await;
                    break;
                }
            }
        }
    }
    debug!("Stream {} on tunnel {} ended", connection_id, tunnel_id);
}
