//! Per-process listener/handler tables, the wire packet, and the link reader
//! shared by both ends of a link.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use super::{ChannelError, MessageChannel, RequestChannel};
use crate::disposer::Disposer;
use crate::transport::{LinkReceiver, LinkSender};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Packet {
    /// Deliver to the receiving process's listeners.
    Message { channel: String, payload: Value },
    /// View → host: fan out to every process, sender included.
    Broadcast { channel: String, payload: Value },
    Request {
        id: u64,
        channel: String,
        args: Value,
    },
    Response { id: u64, outcome: Outcome },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub(crate) enum Outcome {
    Ok(Value),
    NoListener,
    Failed(String),
}

pub(crate) fn encode(packet: &Packet) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(packet)
}

pub(crate) fn send_packet(sender: &LinkSender, packet: &Packet) -> Result<(), ChannelError> {
    let bytes = encode(packet).map_err(|e| ChannelError::codec(packet_channel(packet), e))?;
    sender.send(bytes)?;
    Ok(())
}

fn packet_channel(packet: &Packet) -> &str {
    match packet {
        Packet::Message { channel, .. }
        | Packet::Broadcast { channel, .. }
        | Packet::Request { channel, .. } => channel,
        Packet::Response { .. } => "<response>",
    }
}

// ---------------------------------------------------------------------------
// Listener / handler tables
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;
type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Dispatcher {
    listeners: DashMap<String, Vec<(u64, Listener)>>,
    handlers: DashMap<String, Handler>,
    next_listener_id: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn listen<T, F>(self: &Arc<Self>, channel: &MessageChannel<T>, f: F) -> Disposer
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let channel_id = channel.id();
        let listener: Listener = Arc::new(move |payload: &Value| {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(value) => f(value),
                Err(e) => {
                    tracing::warn!(channel = %channel_id, error = %e, "Dropping undecodable message");
                }
            }
        });

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(channel_id.to_string())
            .or_default()
            .push((id, listener));

        let weak: Weak<Self> = Arc::downgrade(self);
        Disposer::from_fn(move || {
            let Some(dispatcher) = weak.upgrade() else {
                return;
            };
            if let Some(mut list) = dispatcher.listeners.get_mut(channel_id) {
                list.retain(|(listener_id, _)| *listener_id != id);
            }
            // Checked again under the shard lock; a listener added meanwhile keeps the entry
            dispatcher.listeners.remove_if(channel_id, |_, list| list.is_empty());
        })
    }

    pub(crate) fn handle<A, R, F, Fut>(
        self: &Arc<Self>,
        channel: &RequestChannel<A, R>,
        f: F,
    ) -> Result<Disposer, ChannelError>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let channel_id = channel.id();
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args: Value| {
            let f = f.clone();
            async move {
                let args: A = serde_json::from_value(args)
                    .map_err(|e| anyhow::anyhow!("invalid arguments for {channel_id}: {e}"))?;
                let response = (*f)(args).await?;
                anyhow::Ok(serde_json::to_value(response)?)
            }
            .boxed()
        });

        match self.handlers.entry(channel_id.to_string()) {
            Entry::Occupied(_) => Err(ChannelError::HandlerAlreadyRegistered(
                channel_id.to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                let weak: Weak<Self> = Arc::downgrade(self);
                Ok(Disposer::from_fn(move || {
                    if let Some(dispatcher) = weak.upgrade() {
                        dispatcher.handlers.remove(channel_id);
                    }
                }))
            }
        }
    }

    /// Invoke every listener of `channel`. Returns how many ran.
    pub(crate) fn deliver(&self, channel: &str, payload: &Value) -> usize {
        // Clone out of the map so listeners may (un)subscribe re-entrantly
        let listeners: Vec<Listener> = match self.listeners.get(channel) {
            Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };
        for listener in &listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                tracing::error!(channel = %channel, "Message listener panicked");
            }
        }
        listeners.len()
    }

    /// Run the handler for `channel`, if any.
    pub(crate) async fn answer(&self, channel: &str, args: Value) -> Outcome {
        let handler = match self.handlers.get(channel) {
            Some(h) => h.clone(),
            None => return Outcome::NoListener,
        };
        match AssertUnwindSafe(handler(args)).catch_unwind().await {
            Ok(Ok(value)) => Outcome::Ok(value),
            Ok(Err(e)) => Outcome::Failed(format!("{e:#}")),
            Err(_) => Outcome::Failed("request handler panicked".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Outstanding requests
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    waiting: DashMap<u64, oneshot::Sender<Outcome>>,
}

impl PendingRequests {
    fn register(&self) -> (u64, oneshot::Receiver<Outcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        (id, rx)
    }

    fn complete(&self, id: u64, outcome: Outcome) {
        match self.waiting.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(request = id, "Response for unknown request"),
        }
    }

    /// Drop every waiter; their callers observe a disconnect.
    pub(crate) fn fail_all(&self) {
        self.waiting.clear();
    }
}

pub(crate) async fn request_over<A, R>(
    sender: &LinkSender,
    pending: &PendingRequests,
    peer: &str,
    channel: &RequestChannel<A, R>,
    args: &A,
) -> Result<R, ChannelError>
where
    A: Serialize,
    R: DeserializeOwned,
{
    let channel_id = channel.id();
    let args = serde_json::to_value(args).map_err(|e| ChannelError::codec(channel_id, e))?;
    let (id, rx) = pending.register();

    let packet = Packet::Request {
        id,
        channel: channel_id.to_string(),
        args,
    };
    if let Err(e) = send_packet(sender, &packet) {
        pending.waiting.remove(&id);
        return Err(e);
    }

    match rx.await {
        Ok(Outcome::Ok(value)) => {
            serde_json::from_value(value).map_err(|e| ChannelError::codec(channel_id, e))
        }
        Ok(Outcome::NoListener) => Err(ChannelError::NoListener(channel_id.to_string())),
        Ok(Outcome::Failed(message)) => Err(ChannelError::Remote {
            channel: channel_id.to_string(),
            message,
        }),
        Err(_) => Err(ChannelError::Disconnected(peer.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Link reader
// ---------------------------------------------------------------------------

pub(crate) struct LinkContext {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) pending: Arc<PendingRequests>,
    pub(crate) reply: LinkSender,
    pub(crate) peer: String,
}

/// Pump packets from `receiver` until the peer goes away.
///
/// `relay` receives `Broadcast` packets; `on_close` runs once the link ends.
pub(crate) async fn run_reader<R, C>(ctx: LinkContext, mut receiver: LinkReceiver, relay: R, on_close: C)
where
    R: Fn(String, Value) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    while let Some(bytes) = receiver.recv().await {
        let packet: Packet = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(peer = %ctx.peer, error = %e, "Dropping malformed packet");
                continue;
            }
        };

        match packet {
            Packet::Message { channel, payload } => {
                ctx.dispatcher.deliver(&channel, &payload);
            }
            Packet::Broadcast { channel, payload } => relay(channel, payload),
            Packet::Request { id, channel, args } => {
                let dispatcher = ctx.dispatcher.clone();
                let reply = ctx.reply.clone();
                let peer = ctx.peer.clone();
                tokio::spawn(async move {
                    let outcome = dispatcher.answer(&channel, args).await;
                    if let Err(e) = send_packet(&reply, &Packet::Response { id, outcome }) {
                        tracing::warn!(peer = %peer, channel = %channel, error = %e, "Could not send response");
                    }
                });
            }
            Packet::Response { id, outcome } => ctx.pending.complete(id, outcome),
        }
    }

    tracing::debug!(peer = %ctx.peer, "Link closed");
    ctx.pending.fail_all();
    on_close();
}
