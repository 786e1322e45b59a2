//! Host side of the messaging layer: connected frames, cluster sub-frame
//! addressing, and broadcast fan-out.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Weak};

use super::dispatch::{
    encode, request_over, run_reader, send_packet, Dispatcher, LinkContext, Packet,
    PendingRequests,
};
use super::view::ViewIpc;
use super::{ChannelError, MessageChannel, RequestChannel};
use crate::disposer::Disposer;
use crate::transport::{FrameAddress, Link, LinkSender, link_pair};

/// Sub-frame → host: "cluster `cluster_id` is rendered by this frame".
pub const FRAME_ANNOUNCE: RequestChannel<FrameAnnouncement, ()> =
    RequestChannel::new("frame:announce");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAnnouncement {
    pub cluster_id: String,
    pub frame_id: u32,
    pub process_id: u32,
}

struct ConnectedFrame {
    sender: LinkSender,
    pending: Arc<PendingRequests>,
    top_level: bool,
    visible: bool,
}

struct HostInner {
    dispatcher: Arc<Dispatcher>,
    frames: DashMap<FrameAddress, ConnectedFrame>,
    cluster_frames: Arc<DashMap<String, FrameAddress>>,
}

/// The host process's messaging hub. Cheap to clone.
#[derive(Clone)]
pub struct HostIpc {
    inner: Arc<HostInner>,
}

impl Default for HostIpc {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIpc {
    pub fn new() -> Self {
        let dispatcher = Dispatcher::new();
        let cluster_frames: Arc<DashMap<String, FrameAddress>> = Arc::new(DashMap::new());

        let frames = cluster_frames.clone();
        let announce = dispatcher.handle(&FRAME_ANNOUNCE, move |a: FrameAnnouncement| {
            let address = FrameAddress::new(a.process_id, a.frame_id);
            tracing::debug!(cluster = %a.cluster_id, frame = %address, "Cluster frame announced");
            frames.insert(a.cluster_id, address);
            std::future::ready(anyhow::Ok(()))
        });
        if let Err(e) = announce {
            tracing::error!(error = %e, "Could not install frame announce handler");
        }

        Self {
            inner: Arc::new(HostInner {
                dispatcher,
                frames: DashMap::new(),
                cluster_frames,
            }),
        }
    }

    // -- Local listeners / handlers --

    pub fn listen<T, F>(&self, channel: &MessageChannel<T>, f: F) -> Disposer
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.inner.dispatcher.listen(channel, f)
    }

    pub fn handle<A, R, F, Fut>(
        &self,
        channel: &RequestChannel<A, R>,
        f: F,
    ) -> Result<Disposer, ChannelError>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.inner.dispatcher.handle(channel, f)
    }

    // -- Frames --

    /// Register one end of a link as the frame at `address` and start pumping
    /// its packets. Replaces any previous link at that address.
    pub fn attach(&self, address: FrameAddress, top_level: bool, link: Link) {
        let pending = Arc::new(PendingRequests::default());
        self.inner.frames.insert(
            address,
            ConnectedFrame {
                sender: link.sender.clone(),
                pending: pending.clone(),
                top_level,
                visible: true,
            },
        );

        let ctx = LinkContext {
            dispatcher: self.inner.dispatcher.clone(),
            pending,
            reply: link.sender.clone(),
            peer: address.to_string(),
        };

        let relay_target: Weak<HostInner> = Arc::downgrade(&self.inner);
        let relay = move |channel: String, payload: Value| {
            if let Some(inner) = relay_target.upgrade() {
                HostIpc { inner }.broadcast_value(&channel, payload);
            }
        };

        let close_target: Weak<HostInner> = Arc::downgrade(&self.inner);
        let closing_sender = link.sender;
        let on_close = move || {
            if let Some(inner) = close_target.upgrade() {
                // A newer link may already occupy the address
                let same_link = inner
                    .frames
                    .get(&address)
                    .is_some_and(|f| f.sender.same_channel(&closing_sender));
                if same_link {
                    HostIpc { inner }.detach(address);
                }
            }
        };

        tokio::spawn(run_reader(ctx, link.receiver, relay, on_close));
        tracing::debug!(frame = %address, top_level, "Frame attached");
    }

    /// Connect a new in-process view frame.
    pub fn connect_in_memory(&self, address: FrameAddress, top_level: bool) -> ViewIpc {
        let (host_end, view_end) = link_pair();
        self.attach(address, top_level, host_end);
        ViewIpc::attach(address, view_end)
    }

    /// Forget a frame and every cluster mapping that points at it.
    pub fn detach(&self, address: FrameAddress) {
        if let Some((_, frame)) = self.inner.frames.remove(&address) {
            frame.pending.fail_all();
        }
        self.inner
            .cluster_frames
            .retain(|_, frame_address| *frame_address != address);
        tracing::debug!(frame = %address, "Frame detached");
    }

    pub fn set_visible(&self, address: FrameAddress, visible: bool) {
        if let Some(mut frame) = self.inner.frames.get_mut(&address) {
            frame.visible = visible;
        }
    }

    pub fn connected_frames(&self) -> Vec<FrameAddress> {
        let mut frames: Vec<_> = self.inner.frames.iter().map(|f| *f.key()).collect();
        frames.sort();
        frames
    }

    pub fn register_cluster_frame(&self, cluster_id: impl Into<String>, address: FrameAddress) {
        self.inner.cluster_frames.insert(cluster_id.into(), address);
    }

    pub fn cluster_frame(&self, cluster_id: &str) -> Option<FrameAddress> {
        self.inner.cluster_frames.get(cluster_id).map(|f| *f)
    }

    // -- Sending --

    /// Deliver to local listeners, every visible top-level view, and every
    /// announced sub-frame living in those views' processes.
    ///
    /// Never fails: a target that cannot be reached is logged and skipped.
    /// Returns the number of frames the message was handed to.
    pub fn broadcast<T: Serialize>(&self, channel: &MessageChannel<T>, payload: &T) -> usize {
        match serde_json::to_value(payload) {
            Ok(value) => self.broadcast_value(channel.id(), value),
            Err(e) => {
                tracing::error!(channel = %channel.id(), error = %e, "Could not encode broadcast");
                0
            }
        }
    }

    fn broadcast_value(&self, channel: &str, payload: Value) -> usize {
        self.inner.dispatcher.deliver(channel, &payload);

        let packet = Packet::Message {
            channel: channel.to_string(),
            payload,
        };
        let bytes = match encode(&packet) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Could not encode broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for (address, sender) in self.broadcast_targets() {
            let Some(sender) = sender else {
                tracing::warn!(channel = %channel, frame = %address, "Broadcast target is not connected");
                continue;
            };
            match sender.send(bytes.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(channel = %channel, frame = %address, error = %e, "Failed to deliver broadcast");
                }
            }
        }
        delivered
    }

    /// Visible top-level views in address order, each followed by the
    /// cluster sub-frames of its process.
    fn broadcast_targets(&self) -> Vec<(FrameAddress, Option<LinkSender>)> {
        let mut views: Vec<(FrameAddress, LinkSender)> = self
            .inner
            .frames
            .iter()
            .filter(|f| f.top_level && f.visible)
            .map(|f| (*f.key(), f.sender.clone()))
            .collect();
        views.sort_by_key(|(address, _)| *address);

        let sub_frames: Vec<FrameAddress> = {
            let mut frames: Vec<FrameAddress> =
                self.inner.cluster_frames.iter().map(|f| *f.value()).collect();
            frames.sort();
            frames.dedup();
            frames
        };

        let mut targets = Vec::new();
        for (view, sender) in views {
            targets.push((view, Some(sender)));
            for frame in sub_frames
                .iter()
                .filter(|f| f.process_id == view.process_id && **f != view)
            {
                let sender = self.inner.frames.get(frame).map(|f| f.sender.clone());
                targets.push((*frame, sender));
            }
        }
        targets
    }

    /// Send to one frame only.
    pub fn send_to<T: Serialize>(
        &self,
        address: FrameAddress,
        channel: &MessageChannel<T>,
        payload: &T,
    ) -> Result<(), ChannelError> {
        let sender = self.sender_for(address)?;
        let payload =
            serde_json::to_value(payload).map_err(|e| ChannelError::codec(channel.id(), e))?;
        send_packet(
            &sender,
            &Packet::Message {
                channel: channel.id().to_string(),
                payload,
            },
        )
    }

    /// Ask the handler registered in the frame at `address`.
    pub async fn request_frame<A, R>(
        &self,
        address: FrameAddress,
        channel: &RequestChannel<A, R>,
        args: &A,
    ) -> Result<R, ChannelError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let (sender, pending) = match self.inner.frames.get(&address) {
            Some(f) => (f.sender.clone(), f.pending.clone()),
            None => return Err(ChannelError::UnknownFrame(address)),
        };
        request_over(&sender, &pending, &address.to_string(), channel, args).await
    }

    fn sender_for(&self, address: FrameAddress) -> Result<LinkSender, ChannelError> {
        self.inner
            .frames
            .get(&address)
            .map(|f| f.sender.clone())
            .ok_or(ChannelError::UnknownFrame(address))
    }
}
