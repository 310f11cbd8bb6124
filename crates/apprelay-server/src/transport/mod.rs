//! Frame transports: the browser-facing WebSocket listener, the relay hop
//! connector, and an in-memory pair used by tests and embedders.

pub mod hop;
pub mod memory;
pub mod websocket;
