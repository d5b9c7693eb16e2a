//! Portgate wire protocol
//!
//! Two formats share a tunnel's control channel: binary [`frame`]s carrying
//! raw bytes for one multiplexed connection, and JSON [`messages`] for HTTP
//! exchanges, WebSocket-over-tunnel events and keepalives.

pub mod frame;
pub mod messages;

pub use frame::{Frame, FrameError};
pub use messages::*;
