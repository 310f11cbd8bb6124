//! apprelay-core: Shared protocol library for the application relay.
//!
//! Provides the JSON control messages of the three relay flavors, binary
//! framing for terminal data and file blocks, routing cookies, and the
//! abstract frame transports sessions are written against.

pub mod codec;
pub mod cookie;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode_block, encode_block, BlockStatus, READY_SIGNAL};
pub use cookie::{CookieCodec, HmacCookieCodec, RouteInfo};
pub use error::{RelayError, RelayResult};
pub use messages::{parse_control, Notice, TerminalSize};
pub use transport::{BoxFuture, CloseMode, Frame, FramePair, FrameSink, FrameSource};
