//! In-memory channel transport between the host and its view frames.
//!
//! A link is an ordered, reliable, bidirectional pipe of opaque byte frames.
//! The messaging layer (`crate::ipc`) owns the encoding; this module only
//! moves bytes and reports when the other end is gone.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identifies one rendering frame: the view process it lives in and the
/// frame inside that process. A top-level view is frame `0` by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAddress {
    pub process_id: u32,
    pub frame_id: u32,
}

impl FrameAddress {
    pub const fn new(process_id: u32, frame_id: u32) -> Self {
        Self {
            process_id,
            frame_id,
        }
    }

    /// Main frame of a view process.
    pub const fn top_level(process_id: u32) -> Self {
        Self::new(process_id, 0)
    }
}

impl std::fmt::Display for FrameAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.process_id, self.frame_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Link closed by peer")]
    Closed,
}

/// Sending half of a link. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl LinkSender {
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both senders feed the same link direction.
    pub fn same_channel(&self, other: &LinkSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Receiving half of a link.
#[derive(Debug)]
pub struct LinkReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl LinkReceiver {
    /// Next frame, or `None` once every sender for this direction is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// One end of a link.
#[derive(Debug)]
pub struct Link {
    pub sender: LinkSender,
    pub receiver: LinkReceiver,
}

/// Create two connected link ends. Whatever is sent on one arrives, in
/// order, on the other.
pub fn link_pair() -> (Link, Link) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Link {
            sender: LinkSender { tx: a_tx },
            receiver: LinkReceiver { rx: b_rx },
        },
        Link {
            sender: LinkSender { tx: b_tx },
            receiver: LinkReceiver { rx: a_rx },
        },
    )
}
