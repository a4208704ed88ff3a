use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use live_bus::Subscription;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{merge_verdict, MergeOutcome, VerdictTarget};
use crate::channel::Channel;
use crate::error::ApiResult;
use crate::events::{DomainEvent, JudgeEvent};
use crate::supervisor::ConnectionSupervisor;

/// REST collaborator that re-fetches the whole visible collection.
#[async_trait]
pub trait CollectionSource<T>: Send + Sync {
    async fn reload(&self) -> ApiResult<Vec<T>>;
}

struct Inner<T> {
    entries: Mutex<Vec<T>>,
    source: Arc<dyn CollectionSource<T>>,
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    /// Always locked after `entries` when both are held.
    journal: Mutex<Journal>,
    revision: watch::Sender<u64>,
    reloads: AtomicU64,
}

/// Verdicts merged while at least one reload is in flight. A reload re-applies
/// the ones recorded after it started on top of the list it fetched.
#[derive(Default)]
struct Journal {
    next_seq: u64,
    active: usize,
    verdicts: Vec<(u64, JudgeEvent)>,
}

impl Journal {
    fn begin(&mut self) -> u64 {
        self.active += 1;
        self.next_seq
    }

    fn record(&mut self, verdict: &JudgeEvent) {
        if self.active > 0 {
            self.verdicts.push((self.next_seq, verdict.clone()));
            self.next_seq += 1;
        }
    }

    fn finish(&mut self, since: u64) -> Vec<JudgeEvent> {
        let late = self
            .verdicts
            .iter()
            .filter(|(seq, _)| *seq >= since)
            .map(|(_, verdict)| verdict.clone())
            .collect();
        self.active = self.active.saturating_sub(1);
        if self.active == 0 {
            self.verdicts.clear();
        }
        late
    }
}

/// Keeps a list of submissions in step with the judge channel.
///
/// Every verdict is merged into the matching entry straight away. A terminal
/// verdict also schedules one reload of the full list after the debounce delay;
/// further terminal verdicts inside that window push the reload back instead of
/// queueing more.
pub struct JudgeReconciler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for JudgeReconciler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: VerdictTarget + Sync> JudgeReconciler<T> {
    pub fn new(source: Arc<dyn CollectionSource<T>>, debounce: Duration) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                source,
                debounce,
                pending: Mutex::new(None),
                journal: Mutex::new(Journal::default()),
                revision,
                reloads: AtomicU64::new(0),
            }),
        }
    }

    pub fn replace(&self, entries: Vec<T>) {
        *self.inner.entries.lock() = entries;
        self.inner.bump();
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.inner.entries.lock().clone()
    }

    /// Increments whenever the held list changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn reloads(&self) -> u64 {
        self.inner.reloads.load(Ordering::Relaxed)
    }

    /// Subscribes to the judge supervisor; dropping the handle detaches.
    pub fn attach(&self, supervisor: &ConnectionSupervisor) -> Subscription<DomainEvent> {
        let reconciler = self.clone();
        supervisor.subscribe(move |event| {
            reconciler.handle(event);
        })
    }

    /// Must run inside a Tokio runtime when the event is terminal.
    pub fn handle(&self, event: &DomainEvent) -> MergeOutcome {
        if event.channel != Channel::Judge {
            return MergeOutcome::Unmatched;
        }
        let verdict: JudgeEvent = match event.decode() {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    target = "live.reconcile",
                    error = %err,
                    "ignoring judge event without verdict fields"
                );
                return MergeOutcome::Unmatched;
            }
        };
        self.apply(&verdict)
    }

    pub fn apply(&self, verdict: &JudgeEvent) -> MergeOutcome {
        let outcome = {
            let mut entries = self.inner.entries.lock();
            let outcome = merge_verdict(&mut entries, verdict);
            if outcome != MergeOutcome::Unmatched {
                self.inner.journal.lock().record(verdict);
            }
            outcome
        };
        match outcome {
            MergeOutcome::Unmatched => {
                trace!(
                    target = "live.reconcile",
                    submission = %verdict.submission,
                    "verdict for submission not in view"
                );
            }
            MergeOutcome::Updated { index } => {
                debug!(
                    target = "live.reconcile",
                    submission = %verdict.submission,
                    status = %verdict.status,
                    index,
                    "verdict merged"
                );
                self.inner.bump();
                if verdict.is_terminal() {
                    self.schedule_reload();
                }
            }
        }
        outcome
    }

    fn schedule_reload(&self) {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        let mut pending = self.inner.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                // Outside `pending`: a later debounce never cancels a reload under way.
                tokio::spawn(inner.reload());
            }
        }));
    }
}

impl<T: VerdictTarget + Sync> Inner<T> {
    async fn reload(self: Arc<Self>) {
        let since = self.journal.lock().begin();
        self.reloads.fetch_add(1, Ordering::Relaxed);
        let result = self.source.reload().await;

        let mut entries = self.entries.lock();
        let late = self.journal.lock().finish(since);
        match result {
            Ok(mut fresh) => {
                for verdict in &late {
                    merge_verdict(&mut fresh, verdict);
                }
                debug!(
                    target = "live.reconcile",
                    count = fresh.len(),
                    reapplied = late.len(),
                    "collection reloaded after verdict"
                );
                *entries = fresh;
                drop(entries);
                self.bump();
            }
            Err(err) => {
                warn!(
                    target = "live.reconcile",
                    error = %err,
                    "collection reload failed; keeping merged entries"
                );
            }
        }
    }
}

impl<T> Inner<T> {
    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.abort();
        }
    }
}
