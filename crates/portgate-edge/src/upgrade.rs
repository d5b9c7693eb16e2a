//! HTTP/1.1 upgrade pass-through (WebSocket) to a relay instance

use crate::forward::{X_FORWARDED_HOST, X_FORWARDED_PROTO};
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderMap, HeaderValue, CONNECTION, HOST, UPGRADE};
use axum::http::{StatusCode, Version};
use axum::response::{IntoResponse, Response};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use portgate_router::Instance;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

/// `Connection: upgrade` together with an `Upgrade` header
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers.get_all(CONNECTION).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
                .unwrap_or(false)
        })
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Upstream instance unavailable").into_response()
}

/// `host:port` of a plain-HTTP instance
fn instance_authority(instance: &Instance) -> Option<String> {
    let url = Url::parse(&instance.base_url).ok()?;
    if url.scheme() != "http" {
        return None;
    }
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

/// Replay the upgrade request against `instance` and, on 101, splice the
/// client and instance connections together.
pub async fn forward_upgrade(
    instance: &Instance,
    mut request: Request,
    forwarded_host: Option<&str>,
    scheme: &'static str,
) -> Response {
    let Some(authority) = instance_authority(instance) else {
        warn!("Instance {} cannot take upgraded connections", instance.id);
        return bad_gateway();
    };
    let client_upgrade = hyper::upgrade::on(&mut request);

    let stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Connect to instance {} failed: {}", instance.id, e);
            return bad_gateway();
        }
    };
    let (mut sender, conn) = match http1::handshake(TokioIo::new(stream)).await {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!("HTTP handshake with instance {} failed: {}", instance.id, e);
            return bad_gateway();
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream upgrade connection error: {}", e);
        }
    });

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut builder = axum::http::Request::builder()
        .method(request.method().clone())
        .uri(path_and_query)
        .version(Version::HTTP_11);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in request.headers() {
            if *name != HOST {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Ok(host) = HeaderValue::from_str(&authority) {
            headers.insert(HOST, host);
        }
        if let Some(host) = forwarded_host.and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme));
    }
    let upstream_request = match builder.body(Body::empty()) {
        Ok(upstream_request) => upstream_request,
        Err(e) => {
            warn!("Invalid upgrade request for instance {}: {}", instance.id, e);
            return (StatusCode::BAD_REQUEST, "Invalid upgrade request").into_response();
        }
    };

    let mut response = match sender.send_request(upstream_request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Upgrade request to instance {} failed: {}", instance.id, e);
            return bad_gateway();
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (parts, body) = response.into_parts();
        return Response::from_parts(parts, Body::new(body));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let instance_id = instance.id.clone();
    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("Upgrade with instance {} not completed: {}", instance_id, e);
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => debug!(
                "Upgraded connection to {} closed ({} bytes up, {} down)",
                instance_id, sent, received
            ),
            Err(e) => debug!("Upgraded connection to {} ended: {}", instance_id, e),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}
