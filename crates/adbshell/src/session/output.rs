//! Shell output fan-out.
//!
//! Every unit of shell output is delivered to every registered subscriber,
//! in registration order. The subscriber list is copy-on-write: dispatch
//! clones an `Arc` snapshot and iterates it with no lock held, so callbacks
//! may subscribe or unsubscribe (even themselves) while a dispatch is running.
//! Changes made during a dispatch take effect from the next unit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;

/// Callback receiving one unit of shell output.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies one registration in a [`SubscriberRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Clone)]
enum Sink {
    Callback(OutputCallback),
    Channel(mpsc::UnboundedSender<String>),
}

#[derive(Clone)]
struct Subscriber {
    token: SubscriptionToken,
    sink: Sink,
}

#[derive(Default)]
struct RegistryInner {
    /// Current subscriber list. Replaced wholesale on every change.
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_token: AtomicU64,
    units_dispatched: AtomicU64,
}

impl RegistryInner {
    fn snapshot(&self) -> Arc<Vec<Subscriber>> {
        Arc::clone(&self.subscribers.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update(&self, change: impl FnOnce(&mut Vec<Subscriber>)) {
        let mut current = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = current.as_ref().clone();
        change(&mut next);
        *current = Arc::new(next);
    }

    fn insert(&self, sink: Sink) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.update(|subscribers| subscribers.push(Subscriber { token, sink }));
        token
    }

    fn remove(&self, token: SubscriptionToken) -> bool {
        let mut removed = false;
        self.update(|subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s.token != token);
            removed = subscribers.len() != before;
        });
        removed
    }
}

/// Ordered registry of output subscribers.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. It is invoked for every later output unit.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let token = self.inner.insert(Sink::Callback(Arc::new(callback)));
        tracing::debug!(token = token.0, "Added output subscriber");
        self.subscription(token)
    }

    /// Registers an unbounded channel that receives a copy of every output unit.
    ///
    /// The entry is pruned automatically once the receiver is dropped.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.inner.insert(Sink::Channel(tx));
        tracing::debug!(token = token.0, "Added output channel subscriber");
        (self.subscription(token), rx)
    }

    /// Removes a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let removed = self.inner.remove(token);
        if removed {
            tracing::debug!(token = token.0, "Removed output subscriber");
        }
        removed
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.inner.snapshot().len()
    }

    /// Returns true if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of units dispatched so far.
    pub fn units_dispatched(&self) -> u64 {
        self.inner.units_dispatched.load(Ordering::Relaxed)
    }

    /// Delivers one output unit to every subscriber registered right now.
    ///
    /// Returns the number of subscribers that received it.
    pub fn dispatch(&self, unit: &str) -> usize {
        self.inner.units_dispatched.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.inner.snapshot();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for subscriber in snapshot.iter() {
            match &subscriber.sink {
                Sink::Callback(callback) => {
                    callback(unit);
                    delivered += 1;
                }
                Sink::Channel(tx) => {
                    if tx.send(unit.to_string()).is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(subscriber.token);
                    }
                }
            }
        }

        for token in closed {
            self.inner.remove(token);
            tracing::debug!(token = token.0, "Removed closed output channel");
        }

        delivered
    }

    fn subscription(&self, token: SubscriptionToken) -> Subscription {
        Subscription {
            token,
            registry: Arc::downgrade(&self.inner),
        }
    }
}

/// Handle returned by a subscribe call.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    token: SubscriptionToken,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    /// The registration token.
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// Removes the registration. Safe to call any number of times.
    ///
    /// Returns true only for the call that actually removed it.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner.remove(self.token),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |unit: &str| sink.lock().unwrap().push(unit.to_string()))
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = SubscriberRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.dispatch("ignored"), 0);
        assert_eq!(registry.units_dispatched(), 1);
    }

    #[test]
    fn test_every_subscriber_receives_each_unit_once() {
        let registry = SubscriberRegistry::new();
        let (first, cb1) = recorder();
        let (second, cb2) = recorder();
        let (third, cb3) = recorder();
        registry.subscribe(cb1);
        registry.subscribe(cb2);
        registry.subscribe(cb3);

        assert_eq!(registry.dispatch("one"), 3);
        assert_eq!(registry.dispatch("two"), 3);

        for seen in [first, second, third] {
            assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
        }
    }

    #[test]
    fn test_dispatch_order_follows_registration_order() {
        let registry = SubscriberRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..4 {
            let order = Arc::clone(&order);
            registry.subscribe(move |_| order.lock().unwrap().push(id));
        }

        registry.dispatch("x");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let (seen, cb) = recorder();
        let subscription = registry.subscribe(cb);

        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert!(!registry.unsubscribe(subscription.token()));

        registry.dispatch("after");
        assert!(seen.lock().unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_only_removes_own_entry() {
        let registry = SubscriberRegistry::new();
        let (kept, cb1) = recorder();
        let (_, cb2) = recorder();
        registry.subscribe(cb1);
        let removed = registry.subscribe(cb2);

        removed.unsubscribe();
        registry.dispatch("x");
        assert_eq!(registry.len(), 1);
        assert_eq!(*kept.lock().unwrap(), vec!["x"]);
    }

    #[test]
    fn test_callback_can_unsubscribe_itself_during_dispatch() {
        let registry = SubscriberRegistry::new();
        let calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let subscription = {
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            registry.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = slot.lock().unwrap().as_ref() {
                    own.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(subscription);

        let (other, cb) = recorder();
        registry.subscribe(cb);

        registry.dispatch("first");
        registry.dispatch("second");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*other.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_subscribe_during_dispatch_applies_to_next_unit() {
        let registry = SubscriberRegistry::new();
        let (late, late_cb) = recorder();
        let late_cb = Arc::new(Mutex::new(Some(late_cb)));

        {
            let registry_handle = registry.clone();
            let late_cb = Arc::clone(&late_cb);
            registry.subscribe(move |_| {
                if let Some(cb) = late_cb.lock().unwrap().take() {
                    registry_handle.subscribe(cb);
                }
            });
        }

        registry.dispatch("first");
        assert!(late.lock().unwrap().is_empty());
        registry.dispatch("second");
        assert_eq!(*late.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_channel_subscriber_receives_units() {
        let registry = SubscriberRegistry::new();
        let (_subscription, mut rx) = registry.subscribe_channel();

        registry.dispatch("a.txt\n");
        registry.dispatch("b.txt\n");

        assert_eq!(rx.recv().await.unwrap(), "a.txt\n");
        assert_eq!(rx.recv().await.unwrap(), "b.txt\n");
    }

    #[test]
    fn test_closed_channel_is_pruned() {
        let registry = SubscriberRegistry::new();
        let (_subscription, rx) = registry.subscribe_channel();
        assert_eq!(registry.len(), 1);

        drop(rx);
        assert_eq!(registry.dispatch("x"), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_subscription_outliving_registry() {
        let registry = SubscriberRegistry::new();
        let subscription = registry.subscribe(|_| {});
        drop(registry);
        assert!(!subscription.unsubscribe());
    }
}
