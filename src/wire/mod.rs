pub mod frame;
pub mod message;
pub mod payload;

pub use frame::Frame;
pub use message::{Message, PeerEntry, SiblingEntry, TopologyUpdate};
pub use payload::Payload;

use std::io;

/// Errors surfaced by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The remote closed the stream before or inside a frame.
    #[error("peer closed the connection")]
    PeerClosed,
    /// A frame arrived with a header this node does not understand.
    #[error("unknown message header {0:#04x}")]
    UnknownHeader(u8),
    /// The payload did not match the layout its header promises.
    #[error("malformed payload for header {0:#04x}")]
    Malformed(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}
