// src/fanout.rs
//
// Serial stream subscribers and the registry that fans serial lines out to
// them. Delivery to one subscriber never depends on another: a closed client
// is dropped from the set, a slow one loses lines but keeps its place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::StreamEvent;

pub type SubscriberId = Uuid;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriberWriteError {
    #[error("stream client has gone away")]
    Closed,
    #[error("stream client is not keeping up")]
    Lagging,
}

/// One live stream client
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    /// Queue an event without blocking
    fn send(&self, event: &StreamEvent) -> Result<(), SubscriberWriteError>;

    /// End the client's stream once queued events are written
    fn close(&self);
}

struct Member {
    subscriber: Arc<dyn Subscriber>,
    lagging: bool,
}

/// The set of live subscribers
#[derive(Default)]
pub struct SubscriberRegistry {
    members: Mutex<Vec<Member>>,
}

// ============================================================================
// Registry
// ============================================================================

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. It is sent the connected acknowledgement before any
    /// serial line can reach it.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = subscriber.id();
        let Ok(mut members) = self.members.lock() else {
            return id;
        };

        if let Err(e) = subscriber.send(&StreamEvent::connected()) {
            tlog!("[stream] Client {} could not be acknowledged: {}", short_id(id), e);
            subscriber.close();
            return id;
        }

        members.push(Member {
            subscriber,
            lagging: false,
        });
        tlog!(
            "[stream] Client {} connected ({} total)",
            short_id(id),
            members.len()
        );
        id
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let Ok(mut members) = self.members.lock() else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m.subscriber.id() != id);
        let removed = members.len() != before;
        if removed {
            tlog!(
                "[stream] Client {} disconnected ({} remaining)",
                short_id(id),
                members.len()
            );
        }
        removed
    }

    /// Deliver an event to every subscriber. Returns how many accepted it.
    pub fn publish(&self, event: &StreamEvent) -> usize {
        let Ok(mut members) = self.members.lock() else {
            return 0;
        };
        deliver(&mut members, event)
    }

    /// Like `publish`, but checks `cancelled` under the registry lock so that
    /// nothing is delivered once a disconnect has begun. `None` means the
    /// event was suppressed.
    pub fn publish_unless(&self, event: &StreamEvent, cancelled: &AtomicBool) -> Option<usize> {
        let Ok(mut members) = self.members.lock() else {
            return None;
        };
        if cancelled.load(Ordering::SeqCst) {
            return None;
        }
        Some(deliver(&mut members, event))
    }

    /// Send a final event to every subscriber, close them and empty the set.
    /// Returns how many were notified.
    pub fn close_all(&self, event: &StreamEvent) -> usize {
        let drained: Vec<Member> = match self.members.lock() {
            Ok(mut members) => members.drain(..).collect(),
            Err(_) => return 0,
        };

        let mut notified = 0;
        for member in drained {
            if member.subscriber.send(event).is_ok() {
                notified += 1;
            }
            member.subscriber.close();
        }
        notified
    }

    pub fn len(&self) -> usize {
        self.members.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deliver(members: &mut Vec<Member>, event: &StreamEvent) -> usize {
    let mut delivered = 0;
    members.retain_mut(|member| match member.subscriber.send(event) {
        Ok(()) => {
            if member.lagging {
                tlog!("[stream] Client {} caught up", short_id(member.subscriber.id()));
                member.lagging = false;
            }
            delivered += 1;
            true
        }
        Err(SubscriberWriteError::Lagging) => {
            if !member.lagging {
                tlog!(
                    "[stream] Client {} is lagging, dropping lines for it",
                    short_id(member.subscriber.id())
                );
                member.lagging = true;
            }
            true
        }
        Err(SubscriberWriteError::Closed) => {
            tlog!(
                "[stream] Client {} went away, removing",
                short_id(member.subscriber.id())
            );
            false
        }
    });
    delivered
}

fn short_id(id: SubscriberId) -> String {
    id.to_string()[..8].to_string()
}

// ============================================================================
// Channel subscriber
// ============================================================================

/// Subscriber backed by a bounded channel; the receiving half feeds an HTTP
/// response stream.
pub struct ChannelSubscriber {
    id: SubscriberId,
    tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
}

impl ChannelSubscriber {
    /// `backlog` bounds how many events may wait for a slow client
    pub fn new(backlog: usize) -> (Arc<Self>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let subscriber = ChannelSubscriber {
            id: Uuid::new_v4(),
            tx: Mutex::new(Some(tx)),
        };
        (Arc::new(subscriber), rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn send(&self, event: &StreamEvent) -> Result<(), SubscriberWriteError> {
        let guard = self.tx.lock().map_err(|_| SubscriberWriteError::Closed)?;
        let tx = guard.as_ref().ok_or(SubscriberWriteError::Closed)?;
        tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubscriberWriteError::Lagging,
            mpsc::error::TrySendError::Closed(_) => SubscriberWriteError::Closed,
        })
    }

    fn close(&self) {
        // Dropping the sender ends the receiver after it drains
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// Removes its subscriber from the registry when dropped. Held by the HTTP
/// response stream so a client that goes away is unsubscribed promptly.
pub struct SubscriptionGuard {
    registry: Arc<SubscriberRegistry>,
    id: SubscriberId,
}

impl SubscriptionGuard {
    pub fn new(registry: Arc<SubscriberRegistry>, id: SubscriberId) -> Self {
        SubscriptionGuard { registry, id }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.id);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{StreamEventKind, SERVER_CLOSING_MESSAGE};

    /// Records everything it is sent; can be told to fail
    struct Recorder {
        id: SubscriberId,
        events: Mutex<Vec<StreamEvent>>,
        fail_with: Mutex<Option<SubscriberWriteError>>,
        closed: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                id: Uuid::new_v4(),
                events: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
                closed: AtomicBool::new(false),
            })
        }

        fn fail(&self, err: SubscriberWriteError) {
            *self.fail_with.lock().unwrap() = Some(err);
        }

        fn recover(&self) {
            *self.fail_with.lock().unwrap() = None;
        }

        fn messages(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.kind == StreamEventKind::Serial)
                .map(|e| e.message.clone())
                .collect()
        }

        fn kinds(&self) -> Vec<StreamEventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    impl Subscriber for Recorder {
        fn id(&self) -> SubscriberId {
            self.id
        }

        fn send(&self, event: &StreamEvent) -> Result<(), SubscriberWriteError> {
            if let Some(err) = *self.fail_with.lock().unwrap() {
                return Err(err);
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_subscribe_sends_ack_first() {
        let registry = SubscriberRegistry::new();
        let sub = Recorder::new();
        registry.subscribe(sub.clone());
        registry.publish(&StreamEvent::serial("a"));

        assert_eq!(
            sub.kinds(),
            vec![StreamEventKind::Connected, StreamEventKind::Serial]
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_lines() {
        let registry = SubscriberRegistry::new();
        let early = Recorder::new();
        registry.subscribe(early.clone());
        registry.publish(&StreamEvent::serial("one"));

        let late = Recorder::new();
        registry.subscribe(late.clone());
        registry.publish(&StreamEvent::serial("two"));

        assert_eq!(early.messages(), vec!["one", "two"]);
        assert_eq!(late.messages(), vec!["two"]);
    }

    #[test]
    fn test_closed_subscriber_removed_others_unaffected() {
        let registry = SubscriberRegistry::new();
        let a = Recorder::new();
        let b = Recorder::new();
        let c = Recorder::new();
        registry.subscribe(a.clone());
        registry.subscribe(b.clone());
        registry.subscribe(c.clone());

        b.fail(SubscriberWriteError::Closed);
        for line in ["x", "y", "z"] {
            registry.publish(&StreamEvent::serial(line));
        }

        assert_eq!(a.messages(), vec!["x", "y", "z"]);
        assert_eq!(c.messages(), vec!["x", "y", "z"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lagging_subscriber_keeps_membership() {
        let registry = SubscriberRegistry::new();
        let slow = Recorder::new();
        let fast = Recorder::new();
        registry.subscribe(slow.clone());
        registry.subscribe(fast.clone());

        slow.fail(SubscriberWriteError::Lagging);
        assert_eq!(registry.publish(&StreamEvent::serial("dropped")), 1);
        slow.recover();
        assert_eq!(registry.publish(&StreamEvent::serial("kept")), 2);

        assert_eq!(slow.messages(), vec!["kept"]);
        assert_eq!(fast.messages(), vec!["dropped", "kept"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ack_failure_never_joins() {
        let registry = SubscriberRegistry::new();
        let sub = Recorder::new();
        sub.fail(SubscriberWriteError::Closed);
        registry.subscribe(sub.clone());
        assert!(registry.is_empty());
        assert!(sub.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unsubscribe_twice() {
        let registry = SubscriberRegistry::new();
        let sub = Recorder::new();
        let id = registry.subscribe(sub);
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
    }

    #[test]
    fn test_close_all_notifies_and_empties() {
        let registry = SubscriberRegistry::new();
        let a = Recorder::new();
        let b = Recorder::new();
        registry.subscribe(a.clone());
        registry.subscribe(b.clone());

        let notified = registry.close_all(&StreamEvent::disconnected(SERVER_CLOSING_MESSAGE));
        assert_eq!(notified, 2);
        assert!(registry.is_empty());
        for sub in [&a, &b] {
            assert_eq!(sub.kinds().last(), Some(&StreamEventKind::Disconnected));
            assert!(sub.closed.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn test_publish_unless_cancelled() {
        let registry = SubscriberRegistry::new();
        let sub = Recorder::new();
        registry.subscribe(sub.clone());
        let cancel = AtomicBool::new(false);

        assert_eq!(registry.publish_unless(&StreamEvent::serial("a"), &cancel), Some(1));
        cancel.store(true, Ordering::SeqCst);
        assert_eq!(registry.publish_unless(&StreamEvent::serial("b"), &cancel), None);
        assert_eq!(sub.messages(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_channel_subscriber_lag_and_close() {
        let (sub, mut rx) = ChannelSubscriber::new(2);
        assert!(sub.send(&StreamEvent::serial("1")).is_ok());
        assert!(sub.send(&StreamEvent::serial("2")).is_ok());
        assert_eq!(
            sub.send(&StreamEvent::serial("3")),
            Err(SubscriberWriteError::Lagging)
        );

        sub.close();
        assert_eq!(
            sub.send(&StreamEvent::serial("4")),
            Err(SubscriberWriteError::Closed)
        );

        assert_eq!(rx.recv().await.map(|e| e.message), Some("1".to_string()));
        assert_eq!(rx.recv().await.map(|e| e.message), Some("2".to_string()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_subscriber_receiver_dropped() {
        let (sub, rx) = ChannelSubscriber::new(4);
        drop(rx);
        assert_eq!(
            sub.send(&StreamEvent::serial("x")),
            Err(SubscriberWriteError::Closed)
        );
    }

    #[test]
    fn test_guard_unsubscribes_on_drop() {
        let registry = Arc::new(SubscriberRegistry::new());
        let sub = Recorder::new();
        let id = registry.subscribe(sub);
        {
            let _guard = SubscriptionGuard::new(registry.clone(), id);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
