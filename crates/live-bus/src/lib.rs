//! In-process fan-out for live channel events.
//!
//! A [`SubscriberRegistry`] lets any number of independent consumers observe the
//! events of one connection without owning its lifecycle. Dispatch is
//! synchronous: every subscriber registered when `dispatch` starts is invoked
//! before it returns, and a panicking callback is logged and skipped without
//! affecting the rest.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

enum Sink<E> {
    Callback(Arc<dyn Fn(&E) + Send + Sync>),
    Queue(mpsc::UnboundedSender<Arc<E>>),
}

impl<E> Clone for Sink<E> {
    fn clone(&self) -> Self {
        match self {
            Sink::Callback(callback) => Sink::Callback(Arc::clone(callback)),
            Sink::Queue(tx) => Sink::Queue(tx.clone()),
        }
    }
}

struct Registered<E> {
    id: SubscriberId,
    sink: Sink<E>,
}

impl<E> Clone for Registered<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sink: self.sink.clone(),
        }
    }
}

struct RegistryInner<E> {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Registered<E>>>,
}

impl<E> RegistryInner<E> {
    fn remove(&self, id: SubscriberId) -> bool {
        let mut guard = self.subscribers.write();
        let before = guard.len();
        guard.retain(|entry| entry.id != id);
        before != guard.len()
    }
}

/// Set of subscribers sharing one event source.
pub struct SubscriberRegistry<E> {
    inner: Arc<RegistryInner<E>>,
}

impl<E> Clone for SubscriberRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for SubscriberRegistry<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }
}

impl<E> std::fmt::Debug for SubscriberRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.inner.subscribers.read().len())
            .finish()
    }
}

impl<E: Send + Sync + 'static> SubscriberRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`. The returned handle removes it again, either through
    /// [`Subscription::unsubscribe`] or when dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Sink::Callback(Arc::new(callback)))
    }

    /// Registers a subscriber that forwards every event into an unbounded queue,
    /// for consumers that would rather `.await` events than run inside dispatch.
    pub fn subscribe_queue(&self) -> (Subscription<E>, mpsc::UnboundedReceiver<Arc<E>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(Sink::Queue(tx)), rx)
    }

    fn register(&self, sink: Sink<E>) -> Subscription<E> {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push(Registered { id, sink });
        trace!(target = "live.bus", subscriber = id.0, "subscriber added");
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every subscriber registered at the time of the call and
    /// returns how many received it.
    ///
    /// The subscriber list is snapshotted before any callback runs, so callbacks may
    /// subscribe or unsubscribe (themselves or others) freely.
    pub fn dispatch(&self, event: Arc<E>) -> usize {
        let snapshot: Vec<Registered<E>> = self.inner.subscribers.read().clone();
        let mut delivered = 0;
        for entry in snapshot {
            match entry.sink {
                Sink::Callback(callback) => {
                    let outcome = catch_unwind(AssertUnwindSafe(|| callback(&*event)));
                    match outcome {
                        Ok(()) => delivered += 1,
                        Err(panic) => {
                            warn!(
                                target = "live.bus",
                                subscriber = entry.id.0,
                                reason = panic_message(&panic),
                                "subscriber panicked during dispatch"
                            );
                        }
                    }
                }
                Sink::Queue(tx) => {
                    if tx.send(Arc::clone(&event)).is_ok() {
                        delivered += 1;
                    } else {
                        trace!(
                            target = "live.bus",
                            subscriber = entry.id.0,
                            "queue receiver gone; dropping subscriber"
                        );
                        self.inner.remove(entry.id);
                    }
                }
            }
        }
        delivered
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(text) = panic.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Registration handle returned by [`SubscriberRegistry::subscribe`].
///
/// Dropping the handle unsubscribes; call [`Subscription::detach`] to keep the
/// subscriber for the remaining lifetime of the registry.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription<E> {
    id: SubscriberId,
    registry: Weak<RegistryInner<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Removes the subscriber. Safe to call more than once, from inside a callback,
    /// or after the registry itself is gone.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                trace!(target = "live.bus", subscriber = self.id.0, "subscriber removed");
            }
        }
    }

    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn delivers_same_event_to_every_subscriber() {
        let registry = SubscriberRegistry::<String>::new();
        let seen: Arc<Mutex<Vec<(u8, usize)>>> = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            registry.subscribe(move |event: &String| {
                seen.lock().push((1, event.as_ptr() as usize));
            })
        };
        let second = {
            let seen = seen.clone();
            registry.subscribe(move |event: &String| {
                seen.lock().push((2, event.as_ptr() as usize));
            })
        };

        let event = Arc::new("verdict".to_string());
        let delivered = registry.dispatch(Arc::clone(&event));
        assert_eq!(delivered, 2);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, ptr)| *ptr == event.as_ptr() as usize));
        drop((first, second));
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let registry = SubscriberRegistry::<u32>::new();
        let hits = Arc::new(AtomicU64::new(0));
        let sub = {
            let hits = hits.clone();
            registry.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        registry.dispatch(Arc::new(1));
        drop(sub);
        registry.dispatch(Arc::new(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn self_unsubscribe_during_dispatch_still_reaches_others() {
        let registry = SubscriberRegistry::<u32>::new();
        let slot: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));
        let a_hits = Arc::new(AtomicU64::new(0));
        let b_hits = Arc::new(AtomicU64::new(0));

        let a = {
            let slot = slot.clone();
            let a_hits = a_hits.clone();
            registry.subscribe(move |_| {
                a_hits.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = slot.lock().take() {
                    own.unsubscribe();
                }
            })
        };
        *slot.lock() = Some(a);
        let b = {
            let b_hits = b_hits.clone();
            registry.subscribe(move |_| {
                b_hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(registry.dispatch(Arc::new(7)), 2);
        assert_eq!(registry.dispatch(Arc::new(8)), 1);
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 2);
        b.detach();
    }

    #[test]
    fn unsubscribing_another_mid_dispatch_does_not_skip_it_this_round() {
        let registry = SubscriberRegistry::<u32>::new();
        let victim_slot: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));
        let victim_hits = Arc::new(AtomicU64::new(0));

        let killer = {
            let victim_slot = victim_slot.clone();
            registry.subscribe(move |_| {
                victim_slot.lock().take();
            })
        };
        let victim = {
            let victim_hits = victim_hits.clone();
            registry.subscribe(move |_| {
                victim_hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        *victim_slot.lock() = Some(victim);

        registry.dispatch(Arc::new(1));
        registry.dispatch(Arc::new(2));
        assert_eq!(victim_hits.load(Ordering::SeqCst), 1);
        drop(killer);
    }

    #[test]
    fn panicking_subscriber_is_contained() {
        let registry = SubscriberRegistry::<u32>::new();
        let hits = Arc::new(AtomicU64::new(0));
        let _bad = registry.subscribe(|_| panic!("consumer bug"));
        let _good = {
            let hits = hits.clone();
            registry.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(registry.dispatch(Arc::new(3)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn queue_subscriber_receives_shared_event() {
        let registry = SubscriberRegistry::<String>::new();
        let (_sub, mut rx) = registry.subscribe_queue();
        let event = Arc::new("pong-free".to_string());
        registry.dispatch(Arc::clone(&event));
        let received = rx.recv().await.expect("queued event");
        assert!(Arc::ptr_eq(&received, &event));
    }

    #[test]
    fn closed_queue_is_pruned() {
        let registry = SubscriberRegistry::<u8>::new();
        let (sub, rx) = registry.subscribe_queue();
        drop(rx);
        assert_eq!(registry.dispatch(Arc::new(1)), 0);
        assert!(registry.is_empty());
        sub.unsubscribe();
    }
}
