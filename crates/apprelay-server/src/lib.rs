//! apprelay-server: session relay engine.
//!
//! Bridges browser WebSockets to remote desktop, terminal and file-transfer
//! upstreams through a further WebSocket relay hop. Upstream protocol
//! clients are supplied as capabilities (see [`upstream`]).

pub mod bridge;
pub mod config;
pub mod context;
pub mod loopback;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;
pub mod upstream;

pub use context::{Capabilities, EngineContext, EngineSettings};
pub use server::RelayServer;
