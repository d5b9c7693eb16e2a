//! Ownership routing for the public edge
//!
//! Relay instances hold tunnels in memory only, so the edge has to ask
//! them which one owns a given hostname. This crate derives a routing key
//! from a request and picks an instance by probing.

pub mod headers;
pub mod host;
pub mod probe;
pub mod router;
pub mod routing_key;

pub use probe::{HttpOwnershipProbe, Instance, OwnershipProbe};
pub use router::{OwnershipRouter, DEFAULT_PROBE_TIMEOUT};
pub use routing_key::{RequestContext, RoutingKey, PUBLIC_HOST_METADATA, PUBLIC_HOST_PARAM};
