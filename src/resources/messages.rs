// src/resources/messages.rs — Channel pub/sub, local and cross-server
//
// Listeners are keyed by channel and carry the id of the session that owns
// them. Delivery snapshots the channel's listeners first, so callbacks may
// add or remove listeners without deadlocking the bus.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::infra::errors::{Result, WharfError};
use crate::session::listeners::Subscription;
use crate::session::Session;

/// Callback invoked with each message posted to a channel.
pub type MessageCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Receiving end a global backend delivers into.
pub trait RemoteSink: Send + Sync {
    fn deliver(&self, channel: &str, payload: &Value);
    /// `false` once the receiving bus is gone; the backend may drop the sink.
    fn is_alive(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Cross-server transport for messages posted with `global = true`.
#[async_trait]
pub trait GlobalMessageBackend: Send + Sync {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()>;
    fn subscribe(&self, sink: Arc<dyn RemoteSink>);
}

/// In-process stand-in for a shared message broker. Every bus subscribed to
/// the same backend sees every published message.
#[derive(Default)]
pub struct MemoryMessageBackend {
    sinks: RwLock<Vec<Arc<dyn RemoteSink>>>,
}

impl MemoryMessageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }
}

#[async_trait]
impl GlobalMessageBackend for MemoryMessageBackend {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        let sinks: Vec<Arc<dyn RemoteSink>> = self.sinks.read().clone();
        let mut dead = false;
        for sink in &sinks {
            if sink.is_alive() {
                sink.deliver(channel, payload);
            } else {
                dead = true;
            }
        }
        if dead {
            self.sinks.write().retain(|sink| sink.is_alive());
        }
        Ok(())
    }

    fn subscribe(&self, sink: Arc<dyn RemoteSink>) {
        self.sinks.write().push(sink);
    }
}

struct Registration {
    id: ListenerId,
    owner: Uuid,
    callback: MessageCallback,
}

#[derive(Default)]
struct BusInner {
    channels: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn deliver(&self, channel: &str, payload: &Value) -> usize {
        let callbacks: Vec<(ListenerId, MessageCallback)> = match self.channels.read().get(channel) {
            Some(regs) => regs.iter().map(|r| (r.id, r.callback.clone())).collect(),
            None => return 0,
        };
        for (id, callback) in &callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                warn!("Message listener {} on '{}' panicked", id, channel);
            }
        }
        callbacks.len()
    }
}

struct BusSink(Weak<BusInner>);

impl RemoteSink for BusSink {
    fn deliver(&self, channel: &str, payload: &Value) {
        if let Some(bus) = self.0.upgrade() {
            bus.deliver(channel, payload);
        }
    }

    fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Process-wide registry of channel listeners. Cloning shares the bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
    global: Option<Arc<dyn GlobalMessageBackend>>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("channels", &self.inner.channels.read().len())
            .field("global", &self.global.is_some())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// A bus that only delivers within this process.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner::default()),
            global: None,
        }
    }

    /// A bus that also receives, and can publish, cross-server messages.
    pub fn with_global(backend: Arc<dyn GlobalMessageBackend>) -> Self {
        let inner = Arc::new(BusInner::default());
        backend.subscribe(Arc::new(BusSink(Arc::downgrade(&inner))));
        Self {
            inner,
            global: Some(backend),
        }
    }

    pub fn has_global(&self) -> bool {
        self.global.is_some()
    }

    pub fn add_listener(&self, channel: &str, owner: Uuid, callback: MessageCallback) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Registration {
                id,
                owner,
                callback,
            });
        id
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        let mut channels = self.inner.channels.write();
        let Some(regs) = channels.get_mut(channel) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|r| r.id != id);
        let removed = regs.len() != before;
        if regs.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Deliver to listeners in this process. Returns how many were invoked.
    pub fn post_local(&self, channel: &str, payload: &Value) -> usize {
        self.inner.deliver(channel, payload)
    }

    /// Publish through the global backend. Local listeners receive the
    /// message via the backend's fan-out, not directly.
    pub async fn post_global(&self, channel: &str, payload: &Value) -> Result<()> {
        let backend = self.global.as_ref().ok_or_else(|| {
            WharfError::config("global messaging requires a distributed message backend")
        })?;
        backend.publish(channel, payload).await
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map_or(0, |regs| regs.len())
    }

    /// Listeners still registered on behalf of `owner`, across all channels.
    pub fn owned_by(&self, owner: Uuid) -> usize {
        self.inner
            .channels
            .read()
            .values()
            .flat_map(|regs| regs.iter())
            .filter(|r| r.owner == owner)
            .count()
    }
}

/// Messages received on one channel, in arrival order. Ends when the owning
/// session closes and its listener is torn down. Dropping the stream
/// removes its listener.
pub struct MessageStream {
    channel: String,
    rx: mpsc::UnboundedReceiver<Value>,
    subscription: Subscription,
}

impl MessageStream {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn listener_id(&self) -> ListenerId {
        self.subscription.id()
    }

    /// Deserialize each message as `T`. Messages of another shape surface as
    /// errors without ending the stream.
    pub fn typed<T>(mut self) -> impl Stream<Item = Result<T>>
    where
        T: DeserializeOwned,
    {
        async_stream::stream! {
            while let Some(value) = self.rx.recv().await {
                yield serde_json::from_value::<T>(value).map_err(WharfError::from);
            }
        }
    }
}

impl Stream for MessageStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

/// Session-scoped view of the message bus.
pub struct Messages<'s> {
    session: &'s Session,
    bus: &'s MessageBus,
}

impl<'s> Messages<'s> {
    pub(crate) fn new(session: &'s Session, bus: &'s MessageBus) -> Self {
        Self { session, bus }
    }

    /// Post to every listener of `channel`; with `global`, to every server.
    pub async fn post_message<T: Serialize>(&self, channel: &str, message: &T, global: bool) -> Result<()> {
        self.session.ensure_open()?;
        if global && !self.bus.has_global() {
            return Err(WharfError::config(
                "global messaging requires a distributed message backend",
            ));
        }
        let payload = serde_json::to_value(message)?;
        if global {
            self.bus.post_global(channel, &payload).await
        } else {
            let delivered = self.bus.post_local(channel, &payload);
            debug!("Posted to '{}' ({} listeners)", channel, delivered);
            Ok(())
        }
    }

    /// Register a listener owned by this session. It is removed
    /// automatically when the session closes.
    pub fn add_listener<F>(&self, channel: &str, callback: F) -> Result<ListenerId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.session.ensure_open()?;
        Ok(self
            .session
            .listener_registry()
            .register(channel, Arc::new(callback)))
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> Result<bool> {
        self.session.ensure_open()?;
        Ok(self.session.listener_registry().unregister(channel, id))
    }

    /// Subscribe to `channel` as a stream. The subscription starts now, so
    /// nothing posted after this call is missed.
    pub fn create_stream(&self, channel: &str) -> Result<MessageStream> {
        self.session.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.session.listener_registry().register_scoped(
            channel,
            Arc::new(move |value: &Value| {
                let _ = tx.send(value.clone());
            }),
        );
        Ok(MessageStream {
            channel: channel.to_string(),
            rx,
            subscription,
        })
    }
}
