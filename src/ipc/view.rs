//! View side of the messaging layer.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::dispatch::{
    request_over, run_reader, send_packet, Dispatcher, LinkContext, Packet, PendingRequests,
};
use super::{ChannelError, MessageChannel, RequestChannel};
use crate::disposer::Disposer;
use crate::transport::{FrameAddress, Link, LinkSender};

struct ViewInner {
    address: FrameAddress,
    dispatcher: Arc<Dispatcher>,
    host: LinkSender,
    pending: Arc<PendingRequests>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ViewInner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// A view frame's connection to the host. Cheap to clone; the link closes
/// when the last clone is dropped or [`ViewIpc::close`] is called.
#[derive(Clone)]
pub struct ViewIpc {
    inner: Arc<ViewInner>,
}

impl ViewIpc {
    /// Take over one end of a link whose other end the host attached.
    pub fn attach(address: FrameAddress, link: Link) -> Self {
        let dispatcher = Dispatcher::new();
        let pending = Arc::new(PendingRequests::default());
        let ctx = LinkContext {
            dispatcher: dispatcher.clone(),
            pending: pending.clone(),
            reply: link.sender.clone(),
            peer: "host".to_string(),
        };

        // Only the host relays broadcasts
        let relay = move |channel: String, _payload: serde_json::Value| {
            tracing::warn!(frame = %address, channel = %channel, "Ignoring broadcast relay sent to a view");
        };
        let reader = tokio::spawn(run_reader(ctx, link.receiver, relay, move || {
            tracing::debug!(frame = %address, "Host link closed");
        }));

        Self {
            inner: Arc::new(ViewInner {
                address,
                dispatcher,
                host: link.sender,
                pending,
                reader: Mutex::new(Some(reader)),
            }),
        }
    }

    pub fn address(&self) -> FrameAddress {
        self.inner.address
    }

    /// Stop reading from the host. Outstanding requests fail with
    /// [`ChannelError::Disconnected`].
    pub fn close(&self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.pending.fail_all();
    }

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

    /// Message the host's listeners.
    pub fn send<T: Serialize>(
        &self,
        channel: &MessageChannel<T>,
        payload: &T,
    ) -> Result<(), ChannelError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ChannelError::codec(channel.id(), e))?;
        send_packet(
            &self.inner.host,
            &Packet::Message {
                channel: channel.id().to_string(),
                payload,
            },
        )
    }

    /// Ask the host to broadcast on our behalf. This frame receives its own
    /// broadcast like every other target.
    pub fn broadcast<T: Serialize>(
        &self,
        channel: &MessageChannel<T>,
        payload: &T,
    ) -> Result<(), ChannelError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ChannelError::codec(channel.id(), e))?;
        send_packet(
            &self.inner.host,
            &Packet::Broadcast {
                channel: channel.id().to_string(),
                payload,
            },
        )
    }

    /// Ask the host's handler for `channel`.
    pub async fn request<A, R>(
        &self,
        channel: &RequestChannel<A, R>,
        args: &A,
    ) -> Result<R, ChannelError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        request_over(&self.inner.host, &self.inner.pending, "host", channel, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::HostIpc;
    use std::time::Duration;

    const PING: MessageChannel<u32> = MessageChannel::new("test:ping");
    const ADD: RequestChannel<(u32, u32), u32> = RequestChannel::new("test:add");
    const FAIL: RequestChannel<(), ()> = RequestChannel::new("test:fail");

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn send_reaches_host_listeners() {
        let host = HostIpc::new();
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        host.listen(&PING, move |n: u32| g.lock().push(n));

        let view = host.connect_in_memory(FrameAddress::top_level(1), true);
        view.send(&PING, &5).unwrap();
        view.send(&PING, &6).unwrap();
        settle().await;

        assert_eq!(*got.lock(), vec![5, 6]);
    }

    #[tokio::test]
    async fn request_returns_host_response() {
        let host = HostIpc::new();
        host.handle(&ADD, |(a, b): (u32, u32)| async move { Ok(a + b) })
            .unwrap();
        let view = host.connect_in_memory(FrameAddress::top_level(1), true);

        assert_eq!(view.request(&ADD, &(2, 3)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn request_without_handler_is_no_listener() {
        let host = HostIpc::new();
        let view = host.connect_in_memory(FrameAddress::top_level(1), true);

        let err = view.request(&ADD, &(1, 1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::NoListener(id) if id == "test:add"));
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_remote() {
        let host = HostIpc::new();
        host.handle(&FAIL, |_: ()| async move {
            Err::<(), _>(anyhow::anyhow!("refused"))
        })
        .unwrap();
        let view = host.connect_in_memory(FrameAddress::top_level(1), true);

        match view.request(&FAIL, &()).await {
            Err(ChannelError::Remote { channel, message }) => {
                assert_eq!(channel, "test:fail");
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn view_broadcast_is_relayed_to_all_views_and_host() {
        let host = HostIpc::new();
        let host_seen = Arc::new(Mutex::new(Vec::new()));
        let h = host_seen.clone();
        host.listen(&PING, move |n: u32| h.lock().push(n));

        let a = host.connect_in_memory(FrameAddress::top_level(1), true);
        let b = host.connect_in_memory(FrameAddress::top_level(2), true);
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let sa = seen_a.clone();
        let sb = seen_b.clone();
        a.listen(&PING, move |n: u32| sa.lock().push(n));
        b.listen(&PING, move |n: u32| sb.lock().push(n));

        a.broadcast(&PING, &9).unwrap();
        settle().await;

        assert_eq!(*host_seen.lock(), vec![9]);
        assert_eq!(*seen_a.lock(), vec![9]);
        assert_eq!(*seen_b.lock(), vec![9]);
    }

    #[tokio::test]
    async fn pending_request_fails_when_closed() {
        let host = HostIpc::new();
        host.handle(&ADD, |(a, b): (u32, u32)| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(a + b)
        })
        .unwrap();
        let view = host.connect_in_memory(FrameAddress::top_level(1), true);

        let closer = view.clone();
        let request = tokio::spawn(async move { view.request(&ADD, &(1, 2)).await });
        settle().await;
        closer.close();

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected(_)));
    }
}
