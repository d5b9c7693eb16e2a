//! Forwarding edge requests to the owning relay instance

use crate::upgrade::{forward_upgrade, is_upgrade_request};
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, CONTENT_LENGTH, HOST};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use portgate_router::headers::strip_hop_by_hop;
use portgate_router::{Instance, OwnershipRouter, RequestContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest request body the edge buffers for forwarding
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct EdgeState {
    router: Arc<OwnershipRouter>,
    instances: Arc<[Instance]>,
    client: reqwest::Client,
    scheme: &'static str,
}

impl EdgeState {
    pub fn new(router: Arc<OwnershipRouter>, instances: Vec<Instance>) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(DEFAULT_FORWARD_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            router,
            instances: instances.into(),
            client,
            scheme: "https",
        }
    }

    /// Scheme reported in `X-Forwarded-Proto`
    pub fn with_scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

/// Choose an instance for the request and relay it there
pub async fn forward(State(state): State<EdgeState>, request: Request) -> Response {
    let ctx = RequestContext::from_parts(request.uri(), request.headers());
    let Some(instance) = state.router.choose(&state.instances, &ctx).await else {
        warn!("No relay instances configured");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No relay instances available");
    };

    if is_upgrade_request(request.headers()) {
        debug!("Passing upgrade through to {}", instance.id);
        return forward_upgrade(&instance, request, ctx.host.as_deref(), state.scheme).await;
    }

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", instance.base_url, path_and_query);

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);
    if let Some(host) = ctx.host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(state.scheme));

    debug!("Forwarding {} {} to {}", parts.method, path_and_query, instance.id);
    let upstream = match state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Forward to instance {} failed: {}", instance.id, e);
            return error_response(StatusCode::BAD_GATEWAY, "Upstream instance unavailable");
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    response_headers.remove(CONTENT_LENGTH);

    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!("Reading response from instance {} failed: {}", instance.id, e);
            return error_response(StatusCode::BAD_GATEWAY, "Upstream instance unavailable");
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
