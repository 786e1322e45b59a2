//! Typed messaging between the host and its view frames.
//!
//! Three addressing modes sit on top of `crate::transport`:
//! - message channels: fire-and-forget to every listener of a channel id
//! - request channels: one handler per process, caller awaits the result
//! - frame-addressed broadcast: host fan-out to visible views and the cluster
//!   sub-frames announced inside them
//!
//! Everything crossing a link is JSON.

mod channel;
mod debounce;
mod dispatch;
mod host;
mod view;

pub use channel::{MessageChannel, RequestChannel};
pub use debounce::Debounced;
pub use host::{FRAME_ANNOUNCE, FrameAnnouncement, HostIpc};
pub use view::ViewIpc;

use crate::transport::{FrameAddress, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("No handler registered for request channel \"{0}\"")]
    NoListener(String),

    #[error("A handler is already registered for request channel \"{0}\"")]
    HandlerAlreadyRegistered(String),

    #[error("Request on \"{channel}\" failed: {message}")]
    Remote { channel: String, message: String },

    #[error("Link to {0} closed before the request completed")]
    Disconnected(String),

    #[error("No connected frame at {0}")]
    UnknownFrame(FrameAddress),

    #[error("Payload on \"{channel}\" could not be encoded or decoded: {source}")]
    Codec {
        channel: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ChannelError {
    pub(crate) fn codec(channel: &str, source: serde_json::Error) -> Self {
        Self::Codec {
            channel: channel.to_string(),
            source,
        }
    }
}
