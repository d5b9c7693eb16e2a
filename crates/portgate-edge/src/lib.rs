//! Portgate edge
//!
//! Terminates TLS for tenant hostnames, picks the relay instance that owns
//! each request's tunnel and forwards the request there. WebSocket upgrades
//! are passed through as raw connections. A plain-HTTP listener redirects
//! to HTTPS and passes ACME challenges through.

pub mod config;
pub mod forward;
pub mod redirect;
pub mod server;
pub mod upgrade;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use config::{parse_instance, EdgeArgs};
pub use forward::EdgeState;
pub use redirect::RedirectState;
pub use server::serve_https;

/// Router for the HTTPS listener: every request is forwarded
pub fn build_https_router(state: EdgeState) -> Router {
    Router::new()
        .fallback(forward::forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the plain-HTTP listener
pub fn build_http_router(state: RedirectState) -> Router {
    Router::new()
        .fallback(redirect::redirect_or_forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
