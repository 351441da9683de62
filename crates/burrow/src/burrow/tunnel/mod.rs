//! Relay side of the tunnel: one WebSocket session per agent, multiplexed
//! HTTP request/response frames over it, and raw TCP routes on side ports.
//!
//! Wire format is described in `DESIGN.md` (Tunnel frames).

pub mod auth;
pub mod http_proxy;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod server;
pub mod session;
pub mod tcp;
