// src/session/listeners.rs — Listeners a session owns and tears down at close

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use uuid::Uuid;

use super::Session;
use crate::resources::messages::{ListenerId, MessageBus, MessageCallback};

type Registrations = Arc<Mutex<Vec<(String, ListenerId)>>>;

/// Tracks the message-bus registrations made through one session, so close
/// can remove every one of them.
pub struct ListenerRegistry {
    bus: MessageBus,
    owner: Uuid,
    registrations: Registrations,
}

impl ListenerRegistry {
    pub fn new(bus: MessageBus, owner: Uuid) -> Self {
        Self {
            bus,
            owner,
            registrations: Arc::default(),
        }
    }

    pub fn register(&mut self, channel: &str, callback: MessageCallback) -> ListenerId {
        let id = self.bus.add_listener(channel, self.owner, callback);
        self.registrations.lock().push((channel.to_string(), id));
        id
    }

    /// Register and hand back a guard that unregisters on drop.
    pub fn register_scoped(&mut self, channel: &str, callback: MessageCallback) -> Subscription {
        let id = self.register(channel, callback);
        Subscription {
            bus: self.bus.clone(),
            registrations: self.registrations.clone(),
            channel: channel.to_string(),
            id,
        }
    }

    pub fn unregister(&mut self, channel: &str, id: ListenerId) -> bool {
        unregister(&self.bus, &self.registrations, channel, id)
    }

    /// Remove every registration. Returns how many were removed.
    pub fn teardown_all(&mut self) -> usize {
        let drained: Vec<(String, ListenerId)> = self.registrations.lock().drain(..).collect();
        drained
            .into_iter()
            .filter(|(channel, id)| self.bus.remove_listener(channel, *id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.lock().is_empty()
    }
}

fn unregister(bus: &MessageBus, registrations: &Registrations, channel: &str, id: ListenerId) -> bool {
    {
        let mut regs = registrations.lock();
        let before = regs.len();
        regs.retain(|(c, existing)| !(c == channel && *existing == id));
        if regs.len() == before {
            return false;
        }
    }
    bus.remove_listener(channel, id)
}

/// One registration that ends when this guard is dropped, or earlier if the
/// owning session closes.
pub struct Subscription {
    bus: MessageBus,
    registrations: Registrations,
    channel: String,
    id: ListenerId,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        unregister(&self.bus, &self.registrations, &self.channel, self.id);
    }
}

/// Callback run as the first step of closing a session, while the session
/// still accepts logging and resource access.
pub type WillCloseCallback =
    Box<dyn for<'a> Fn(&'a Session) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WillCloseListenerId(u64);

impl std::fmt::Display for WillCloseListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "will-close-{}", self.0)
    }
}

#[derive(Default)]
pub struct WillCloseListeners {
    next_id: u64,
    listeners: Vec<(WillCloseListenerId, WillCloseCallback)>,
}

impl WillCloseListeners {
    pub fn add(&mut self, callback: WillCloseCallback) -> WillCloseListenerId {
        let id = WillCloseListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, callback));
        id
    }

    pub fn remove(&mut self, id: WillCloseListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// All listeners in registration order, leaving the set empty.
    pub fn take_all(&mut self) -> Vec<(WillCloseListenerId, WillCloseCallback)> {
        std::mem::take(&mut self.listeners)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;

    #[test]
    fn test_teardown_removes_only_own_registrations() {
        let bus = MessageBus::new();
        let mut mine = ListenerRegistry::new(bus.clone(), Uuid::new_v4());
        let mut theirs = ListenerRegistry::new(bus.clone(), Uuid::new_v4());

        mine.register("a", Arc::new(|_: &Value| {}));
        mine.register("b", Arc::new(|_: &Value| {}));
        theirs.register("a", Arc::new(|_: &Value| {}));

        assert_eq!(mine.teardown_all(), 2);
        assert!(mine.is_empty());
        assert_eq!(bus.listener_count("a"), 1);
        assert_eq!(bus.listener_count("b"), 0);
        assert_eq!(theirs.len(), 1);
    }

    #[test]
    fn test_unregister_unknown_is_false() {
        let bus = MessageBus::new();
        let mut reg = ListenerRegistry::new(bus.clone(), Uuid::new_v4());
        let id = reg.register("a", Arc::new(|_: &Value| {}));
        assert!(!reg.unregister("b", id));
        assert!(reg.unregister("a", id));
        assert!(!reg.unregister("a", id));
    }

    #[test]
    fn test_dropped_subscription_unregisters() {
        let bus = MessageBus::new();
        let mut reg = ListenerRegistry::new(bus.clone(), Uuid::new_v4());
        let sub = reg.register_scoped("a", Arc::new(|_: &Value| {}));
        assert_eq!(reg.len(), 1);
        assert_eq!(bus.listener_count("a"), 1);

        drop(sub);
        assert!(reg.is_empty());
        assert_eq!(bus.listener_count("a"), 0);
        assert_eq!(reg.teardown_all(), 0);
    }

    #[test]
    fn test_subscription_outliving_teardown_is_harmless() {
        let bus = MessageBus::new();
        let mut reg = ListenerRegistry::new(bus.clone(), Uuid::new_v4());
        let sub = reg.register_scoped("a", Arc::new(|_: &Value| {}));
        assert_eq!(reg.teardown_all(), 1);
        drop(sub);
        assert_eq!(bus.listener_count("a"), 0);
    }

    #[test]
    fn test_will_close_order_and_removal() {
        let mut set = WillCloseListeners::default();
        let first = set.add(Box::new(|_| Box::pin(async { Ok(()) })));
        let second = set.add(Box::new(|_| Box::pin(async { Ok(()) })));
        let third = set.add(Box::new(|_| Box::pin(async { Ok(()) })));

        assert!(set.remove(second));
        assert!(!set.remove(second));
        let ids: Vec<_> = set.take_all().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![first, third]);
        assert!(set.is_empty());
    }
}
