//! Gateway server library: WebSocket endpoint, handshake/authorization,
//! method registry, event broadcast, and the operator wizard surface.

pub mod auth;
pub mod frames;
pub mod methods;
pub mod server;
pub mod state;
pub mod wizard;
