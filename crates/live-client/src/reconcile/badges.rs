use std::collections::HashMap;
use std::sync::Arc;

use live_bus::Subscription;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::events::{CorrelationKey, DomainEvent, MessageEvent, NotificationEvent};
use crate::supervisor::ConnectionSupervisor;

pub type NotificationEntry = NotificationEvent;

struct FeedInner {
    entries: Mutex<Vec<NotificationEntry>>,
    unread: watch::Sender<usize>,
}

/// Newest-first notification list plus its unread badge.
#[derive(Clone)]
pub struct NotificationFeed {
    inner: Arc<FeedInner>,
}

impl Default for NotificationFeed {
    fn default() -> Self {
        let (unread, _) = watch::channel(0);
        Self {
            inner: Arc::new(FeedInner {
                entries: Mutex::new(Vec::new()),
                unread,
            }),
        }
    }
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, entries: Vec<NotificationEntry>) {
        let mut held = self.inner.entries.lock();
        *held = entries;
        self.publish(&held);
    }

    pub fn snapshot(&self) -> Vec<NotificationEntry> {
        self.inner.entries.lock().clone()
    }

    pub fn unread_count(&self) -> usize {
        *self.inner.unread.borrow()
    }

    pub fn watch_unread(&self) -> watch::Receiver<usize> {
        self.inner.unread.subscribe()
    }

    pub fn attach(&self, supervisor: &ConnectionSupervisor) -> Subscription<DomainEvent> {
        let feed = self.clone();
        supervisor.subscribe(move |event| {
            feed.handle(event);
        })
    }

    /// Updates the entry with the same id in place, or puts a new one first.
    /// Returns `false` for events that are not notifications.
    pub fn handle(&self, event: &DomainEvent) -> bool {
        if event.channel != Channel::Notification {
            return false;
        }
        let notification: NotificationEvent = match event.decode() {
            Ok(notification) => notification,
            Err(err) => {
                warn!(
                    target = "live.reconcile",
                    error = %err,
                    "ignoring undecodable notification"
                );
                return false;
            }
        };
        let mut held = self.inner.entries.lock();
        match held.iter_mut().find(|entry| entry.id == notification.id) {
            Some(existing) => *existing = notification,
            None => {
                debug!(
                    target = "live.reconcile",
                    id = %notification.id,
                    "new notification"
                );
                held.insert(0, notification);
            }
        }
        self.publish(&held);
        true
    }

    pub fn mark_read(&self, id: &CorrelationKey) -> bool {
        let mut held = self.inner.entries.lock();
        let Some(entry) = held.iter_mut().find(|entry| &entry.id == id) else {
            return false;
        };
        entry.is_read = true;
        self.publish(&held);
        true
    }

    pub fn mark_all_read(&self) {
        let mut held = self.inner.entries.lock();
        for entry in held.iter_mut() {
            entry.is_read = true;
        }
        self.publish(&held);
    }

    fn publish(&self, entries: &[NotificationEntry]) {
        let unread = entries.iter().filter(|entry| !entry.is_read).count();
        self.inner.unread.send_if_modified(|current| {
            if *current == unread {
                false
            } else {
                *current = unread;
                true
            }
        });
    }
}

struct ActivityInner {
    refreshes: watch::Sender<u64>,
    by_sender: Mutex<HashMap<CorrelationKey, usize>>,
}

/// Private-message activity: a refresh signal for message-dependent views and
/// per-sender counts of messages seen since they were last read.
#[derive(Clone)]
pub struct MessageActivity {
    inner: Arc<ActivityInner>,
}

impl Default for MessageActivity {
    fn default() -> Self {
        let (refreshes, _) = watch::channel(0);
        Self {
            inner: Arc::new(ActivityInner {
                refreshes,
                by_sender: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl MessageActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes every time a message from some sender arrives.
    pub fn watch_refresh(&self) -> watch::Receiver<u64> {
        self.inner.refreshes.subscribe()
    }

    pub fn refreshes(&self) -> u64 {
        *self.inner.refreshes.borrow()
    }

    pub fn pending_from(&self, sender: &CorrelationKey) -> usize {
        self.inner
            .by_sender
            .lock()
            .get(sender)
            .copied()
            .unwrap_or(0)
    }

    pub fn mark_read(&self, sender: &CorrelationKey) {
        if self.inner.by_sender.lock().remove(sender).is_some() {
            self.bump();
        }
    }

    pub fn attach(&self, supervisor: &ConnectionSupervisor) -> Subscription<DomainEvent> {
        let activity = self.clone();
        supervisor.subscribe(move |event| {
            activity.handle(event);
        })
    }

    /// Returns the sender when the event signals new activity.
    pub fn handle(&self, event: &DomainEvent) -> Option<CorrelationKey> {
        if event.channel != Channel::Message {
            return None;
        }
        let message: MessageEvent = event.decode().ok()?;
        let sender = message.sender?;
        *self
            .inner
            .by_sender
            .lock()
            .entry(sender.clone())
            .or_insert(0) += 1;
        debug!(target = "live.reconcile", sender = %sender, "message activity");
        self.bump();
        Some(sender)
    }

    fn bump(&self) {
        self.inner
            .refreshes
            .send_modify(|count| *count = count.wrapping_add(1));
    }
}
