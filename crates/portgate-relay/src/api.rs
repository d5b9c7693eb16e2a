//! Exposure and ownership probe endpoints

use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use portgate_control::RegistryError;
use portgate_proto::{ExposeRequest, ExposeResponse};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Registry failure as an API response
pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RegistryError::TypeMismatch { .. } => StatusCode::CONFLICT,
            RegistryError::NotStreamType(_) => StatusCode::BAD_REQUEST,
            RegistryError::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Io(_)
            | RegistryError::Bind { .. }
            | RegistryError::ListenerFailed { .. }
            | RegistryError::NotAttached(_)
            | RegistryError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// `POST /api/net-proxy/expose`
pub async fn expose(
    State(state): State<AppState>,
    Json(request): Json<ExposeRequest>,
) -> Result<Json<ExposeResponse>, ApiError> {
    match state.registry.expose_tunnel(&request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!("Expose of tunnel {} failed: {}", request.tunnel_id, e);
            Err(e.into())
        }
    }
}

/// `GET /resolve/{subdomain}`: 200 when an attached tunnel for it lives here
pub async fn resolve_subdomain(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
) -> StatusCode {
    let owned = state.registry.owns_subdomain(&subdomain);
    debug!("Ownership probe for subdomain {}: {}", subdomain, owned);
    if owned {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// `GET /resolve-custom/{domain}`
pub async fn resolve_custom_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> StatusCode {
    let owned = state.registry.owns_custom_domain(&domain);
    debug!("Ownership probe for domain {}: {}", domain, owned);
    if owned {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
