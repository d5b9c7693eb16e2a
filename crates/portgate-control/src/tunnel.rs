//! Per-tunnel state

use crate::channel::ControlChannel;
use crate::connection::Connection;
use crate::listener::ListenerHandle;
use dashmap::DashMap;
use portgate_proto::TunnelMessage;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Control channel attachment of a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Unattached,
    Attached(ControlChannel),
}

impl ChannelState {
    pub fn channel(&self) -> Option<&ControlChannel> {
        match self {
            ChannelState::Unattached => None,
            ChannelState::Attached(channel) => Some(channel),
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, ChannelState::Attached(_))
    }
}

pub struct Tunnel {
    id: String,
    channel: Mutex<ChannelState>,
    connections: DashMap<String, Arc<Connection>>,
    pub(crate) listener: tokio::sync::Mutex<Option<ListenerHandle>>,
    subdomain: Mutex<Option<String>>,
}

impl Tunnel {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel: Mutex::new(ChannelState::Unattached),
            connections: DashMap::new(),
            listener: tokio::sync::Mutex::new(None),
            subdomain: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel_state(&self) -> ChannelState {
        lock(&self.channel).clone()
    }

    pub fn current_channel(&self) -> Option<ControlChannel> {
        lock(&self.channel).channel().cloned()
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.channel).is_attached()
    }

    /// Attach `channel`, returning the handle it displaced
    pub(crate) fn replace_channel(&self, channel: ControlChannel) -> Option<ControlChannel> {
        let previous = std::mem::replace(&mut *lock(&self.channel), ChannelState::Attached(channel));
        match previous {
            ChannelState::Attached(previous) => Some(previous),
            ChannelState::Unattached => None,
        }
    }

    /// Clear the channel only if `channel` is the one attached
    pub(crate) fn clear_channel_if(&self, channel: &ControlChannel) -> bool {
        let mut state = lock(&self.channel);
        if state.channel() == Some(channel) {
            *state = ChannelState::Unattached;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear_channel(&self) -> Option<ControlChannel> {
        match std::mem::take(&mut *lock(&self.channel)) {
            ChannelState::Attached(channel) => Some(channel),
            ChannelState::Unattached => None,
        }
    }

    pub fn subdomain(&self) -> Option<String> {
        lock(&self.subdomain).clone()
    }

    pub(crate) fn set_subdomain(&self, subdomain: Option<String>) -> Option<String> {
        std::mem::replace(&mut *lock(&self.subdomain), subdomain)
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    pub(crate) fn insert_connection(&self, connection: Connection) -> Arc<Connection> {
        let connection = Arc::new(connection);
        self.connections
            .insert(connection.id().to_string(), connection.clone());
        connection
    }

    /// Register a connection unless one with the same id exists
    pub(crate) fn connection_or_insert_with(
        &self,
        connection_id: &str,
        create: impl FnOnce() -> Connection,
    ) -> Arc<Connection> {
        self.connections
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(create()))
            .value()
            .clone()
    }

    /// Remove UDP peers with no traffic for at least `idle`
    pub(crate) fn remove_idle_udp(&self, idle: Duration) -> Vec<Arc<Connection>> {
        self.connection_ids()
            .iter()
            .filter_map(|id| {
                self.connections
                    .remove_if(id, |_, c| c.is_udp() && c.idle_for() >= idle)
                    .map(|(_, c)| c)
            })
            .collect()
    }

    pub(crate) fn remove_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(connection_id).map(|(_, c)| c)
    }

    pub(crate) fn drain_connections(&self) -> Vec<Arc<Connection>> {
        self.connection_ids()
            .iter()
            .filter_map(|id| self.remove_connection(id))
            .collect()
    }

    /// Send one frame to whichever channel is attached; dropped when none is
    pub(crate) async fn send_frame(&self, connection_id: &str, payload: &[u8]) {
        let Some(channel) = self.current_channel() else {
            debug!(
                "Tunnel {} unattached, dropping {} bytes for {}",
                self.id,
                payload.len(),
                connection_id
            );
            return;
        };
        if let Err(e) = channel.send_frame(connection_id, payload).await {
            debug!("Failed to send frame on tunnel {}: {}", self.id, e);
        }
    }

    pub(crate) async fn send_message(&self, message: impl Into<TunnelMessage>) {
        let Some(channel) = self.current_channel() else {
            debug!("Tunnel {} unattached, dropping message", self.id);
            return;
        };
        if let Err(e) = channel.send_message(message).await {
            debug!("Failed to send message on tunnel {}: {}", self.id, e);
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
