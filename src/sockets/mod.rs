//! Live sockets an instance keeps across calls, with tags and auto-replies.

mod registry;
mod socket;

pub use registry::{AutoResponse, SocketRegistry, MAX_TAGS, MAX_TAG_LEN};
pub use socket::{HibernatableSocket, OutboundFrame, SocketMessage, SocketPeer};
