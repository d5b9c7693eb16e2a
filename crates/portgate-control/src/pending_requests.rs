//! Pending requests tracker
//!
//! Tracks HTTP requests forwarded through tunnels and hands each RESPONSE
//! back to the ingress handler waiting on it.

use dashmap::DashMap;
use portgate_proto::HttpTunnelMessage;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks pending HTTP requests awaiting responses
#[derive(Clone)]
pub struct PendingRequests {
    /// Maps request id -> oneshot sender for the response
    requests: Arc<DashMap<String, oneshot::Sender<HttpTunnelMessage>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request.
    /// Returns a receiver that will receive the response.
    pub fn register(&self, request_id: impl Into<String>) -> oneshot::Receiver<HttpTunnelMessage> {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();
        debug!("Registered pending request {}", request_id);
        self.requests.insert(request_id, tx);
        rx
    }

    /// Deliver a response. Returns false if no request with that id is waiting.
    pub fn respond(&self, response: HttpTunnelMessage) -> bool {
        let Some((request_id, tx)) = self.requests.remove(&response.id) else {
            warn!("No pending request found for {}", response.id);
            return false;
        };

        if tx.send(response).is_err() {
            warn!(
                "Failed to deliver response for {} - receiver dropped",
                request_id
            );
            return false;
        }
        debug!("Routed response for {}", request_id);
        true
    }

    /// Cancel a pending request (e.g., on timeout or error)
    pub fn cancel(&self, request_id: &str) {
        if self.requests.remove(request_id).is_some() {
            debug!("Cancelled pending request {}", request_id);
        }
    }

    /// Drop every waiting request; their receivers observe cancellation
    pub fn cancel_all(&self) {
        self.requests.clear();
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
