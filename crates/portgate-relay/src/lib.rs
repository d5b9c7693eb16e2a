//! Portgate relay instance
//!
//! Serves tunnel clients' control channels, the exposure and ownership
//! probe APIs, and public HTTP ingress for the tunnels attached here.

pub mod api;
pub mod config;
pub mod control_ws;
pub mod ingress;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use config::{CustomDomain, RelayArgs};
pub use state::AppState;

/// Build the relay's HTTP router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/net-proxy/tunnel/{tunnel_id}", get(control_ws::stream_tunnel))
        .route("/api/tunnel/{tunnel_id}", get(control_ws::http_tunnel))
        .route("/api/net-proxy/expose", post(api::expose))
        .route("/resolve/{subdomain}", get(api::resolve_subdomain))
        .route("/resolve-custom/{domain}", get(api::resolve_custom_domain))
        .fallback(ingress::ingress)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
