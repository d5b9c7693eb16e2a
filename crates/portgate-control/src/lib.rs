//! Tunnel transport for a relay instance
//!
//! The [`TunnelRegistry`] multiplexes public TCP/UDP sockets, forwarded HTTP
//! requests and browser WebSockets over each tunnel's single
//! [`ControlChannel`].

pub mod channel;
pub mod connection;
pub mod listener;
pub mod pending_requests;
pub mod registry;
pub mod tunnel;

pub use channel::{ChannelError, ChannelMessage, ControlChannel};
pub use connection::{Connection, StreamEvent};
pub use pending_requests::PendingRequests;
pub use registry::{
    Attachment, ForwardError, RegistryConfig, RegistryError, RegistryEvent, StreamHandle,
    TunnelRegistry,
};
pub use tunnel::{ChannelState, Tunnel};
