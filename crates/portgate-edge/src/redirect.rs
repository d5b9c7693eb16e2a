//! Plain-HTTP listener: redirect to HTTPS, except ACME HTTP-01 challenges

use crate::forward::{forward, EdgeState};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use portgate_router::host::normalize_host;
use portgate_router::RequestContext;

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Clone)]
pub struct RedirectState {
    pub forward: EdgeState,
    pub https_port: u16,
}

/// `https://` location for a request, or `None` without a usable host
pub fn https_location(host: &str, https_port: u16, path_and_query: &str) -> Option<String> {
    let host = normalize_host(host)?;
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host
    };
    let authority = if https_port == 443 {
        host
    } else {
        format!("{}:{}", host, https_port)
    };
    Some(format!("https://{}{}", authority, path_and_query))
}

pub async fn redirect_or_forward(State(state): State<RedirectState>, request: Request) -> Response {
    if request.uri().path().starts_with(ACME_CHALLENGE_PREFIX) {
        return forward(State(state.forward), request).await;
    }

    let ctx = RequestContext::from_parts(request.uri(), request.headers());
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match ctx
        .host
        .as_deref()
        .and_then(|host| https_location(host, state.https_port, path_and_query))
    {
        Some(location) => Redirect::permanent(&location).into_response(),
        None => (StatusCode::BAD_REQUEST, "Missing Host header").into_response(),
    }
}
