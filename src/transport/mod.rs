//! Relay transport: wire messages and the authenticated WebSocket client.

mod client;
mod messages;

pub use client::{Transport, TransportCloser, TransportHandle, WsTransport};
pub use messages::{RelayMessage, TransportEvent};
