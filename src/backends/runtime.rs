//! Shared runtime primitives for backend integrations.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

/// One producer, any number of passive listeners, closed exactly once.
///
/// Publishing with no listeners is not an error. After [`Fanout::close`]
/// existing receivers drain what was already sent and then see `Closed`;
/// new subscribers see `Closed` immediately.
pub struct Fanout<T: Clone> {
    sender: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone> Fanout<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        }
    }

    /// Returns false once the fan-out has been closed.
    pub fn publish(&self, value: T) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => {
                let _ = sender.send(value);
                true
            }
            None => false,
        }
    }

    /// Returns true for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Maps request ids to one-shot reply senders.
///
/// A reply is delivered at most once: `resolve` removes the entry, so a
/// second call for the same id finds nothing.
pub struct PendingReplies<T> {
    slots: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> PendingReplies<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id.into(), tx);
        rx
    }

    /// Returns false if nothing was waiting on `id`.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        match self.slots.lock().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, id: &str) {
        self.slots.lock().remove(id);
    }

    /// Drops every sender; waiters observe a closed channel.
    pub fn cancel_all(&self) {
        self.slots.lock().clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for PendingReplies<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Live sessions keyed by session id.
pub struct SessionRegistry<S: ?Sized> {
    sessions: Mutex<HashMap<String, Arc<S>>>,
}

impl<S: ?Sized> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: impl Into<String>, session: Arc<S>) {
        self.sessions.lock().insert(id.into(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<S>> {
        self.sessions.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every session.
    pub fn drain(&self) -> Vec<Arc<S>> {
        self.sessions.lock().drain().map(|(_, session)| session).collect()
    }
}

impl<S: ?Sized> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticSource {
    Stderr,
    Warning,
}

/// A raw diagnostic line from a process or from option validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticLine {
    pub session_id: Option<String>,
    pub source: DiagnosticSource,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Fanout ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fanout_delivers_to_every_subscriber() {
        let fanout = Fanout::new(8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        assert!(fanout.publish(1));
        assert_eq!(a.recv().await.unwrap(), 1);
        assert_eq!(b.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fanout_closes_once() {
        let fanout = Fanout::new(8);
        let mut rx = fanout.subscribe();
        fanout.publish("last");

        assert!(fanout.close());
        assert!(!fanout.close());
        assert!(!fanout.publish("late"));

        assert_eq!(rx.recv().await.unwrap(), "last");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        let mut late = fanout.subscribe();
        assert!(matches!(
            late.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    // ── PendingReplies ───────────────────────────────────────────────────

    #[tokio::test]
    async fn pending_reply_resolves_once() {
        let pending = PendingReplies::new();
        let rx = pending.register("req-1");

        assert!(pending.resolve("req-1", true));
        assert!(!pending.resolve("req-1", false));
        assert!(rx.await.unwrap());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pending_cancel_all_closes_waiters() {
        let pending: PendingReplies<bool> = PendingReplies::new();
        let rx = pending.register("req-1");
        pending.cancel_all();
        assert!(rx.await.is_err());
    }

    // ── SessionRegistry ──────────────────────────────────────────────────

    #[test]
    fn registry_insert_remove_drain() {
        let registry: SessionRegistry<str> = SessionRegistry::new();
        registry.insert("a", Arc::from("session a"));
        registry.insert("b", Arc::from("session b"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").as_deref(), Some("session a"));
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(!registry.contains("a"));

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
    }
}
