//! Delivery queue management
//!
//! The queue owns every message between submission and a terminal outcome.
//! Entries are held in memory for scheduling and written through to a
//! [`BackingStore`] on every change, so that a restart loses nothing: an
//! entry leaves the store only once it has been delivered or dead-lettered.
//!
//! Workers call [`DeliveryQueue::dequeue`], which hands out the entry with the
//! earliest `next_attempt_at` that has already passed, and marks it in flight
//! so no other worker can take it.

mod entry;
pub mod retry;

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use courier_common::{DeliveryStatus, Message, MessageId, internal};
use courier_spool::{BackingStore, EmlArchive, MemoryBackingStore, SpoolError};
use dashmap::DashMap;
use tokio::sync::Notify;

pub use self::entry::{DeadLetter, QueueEntry};
use crate::error::QueueError;

/// Counts of what [`DeliveryQueue::restore`] brought back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub queued: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<MessageId, QueueEntry>,
    dead: DashMap<MessageId, DeadLetter>,
    capacity: usize,
    /// Live entries, maintained separately so capacity checks are atomic
    depth: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
    store: Arc<dyn BackingStore<QueueEntry>>,
    dead_store: Arc<dyn BackingStore<DeadLetter>>,
    archive: EmlArchive,
}

enum Claim {
    Ready(QueueEntry),
    /// Nothing eligible; sleep until the given instant, or until woken
    Wait(Option<DateTime<Utc>>),
}

/// Bounded, persistent queue of messages awaiting delivery
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    pub fn new(
        capacity: usize,
        store: Arc<dyn BackingStore<QueueEntry>>,
        dead_store: Arc<dyn BackingStore<DeadLetter>>,
        archive: EmlArchive,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                dead: DashMap::new(),
                capacity,
                depth: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
                store,
                dead_store,
                archive,
            }),
        }
    }

    /// A queue that keeps nothing across restarts
    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(
            capacity,
            Arc::new(MemoryBackingStore::new()),
            Arc::new(MemoryBackingStore::new()),
            EmlArchive::disabled(),
        )
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Messages awaiting delivery, including those in flight
    pub fn len(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_len(&self) -> usize {
        self.inner.dead.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn get(&self, id: &MessageId) -> Option<QueueEntry> {
        self.inner.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn get_dead_letter(&self, id: &MessageId) -> Option<DeadLetter> {
        self.inner.dead.get(id).map(|entry| entry.value().clone())
    }

    /// Every dead letter, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut dead: Vec<_> = self
            .inner
            .dead
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        dead.sort_by(|a, b| {
            a.dead_lettered_at
                .cmp(&b.dead_lettered_at)
                .then_with(|| a.id().cmp(&b.id()))
        });
        dead
    }

    fn reserve(&self) -> Result<(), QueueError> {
        let capacity = self.inner.capacity;
        self.inner
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < capacity).then_some(depth + 1)
            })
            .map(|_| ())
            .map_err(|_| QueueError::Full { capacity })
    }

    fn release(&self) {
        let _ = self
            .inner
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                depth.checked_sub(1)
            });
    }

    /// Accept a message for delivery.
    ///
    /// Never waits for space: a full queue fails immediately with
    /// [`QueueError::Full`].
    pub async fn enqueue(&self, message: Message) -> Result<QueueEntry, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        self.reserve()?;

        let entry = QueueEntry::new(Arc::new(message));
        let id = entry.id();

        if let Err(e) = self.inner.store.write(&id, &entry).await {
            self.release();
            return Err(e.into());
        }

        self.inner.entries.insert(id, entry.clone());
        self.inner.notify.notify_one();

        internal!(level = DEBUG, "Queued {id} ({} of {})", self.len(), self.capacity());
        Ok(entry)
    }

    fn claim_next(&self) -> Claim {
        let now = Utc::now();

        loop {
            let mut candidate: Option<(DateTime<Utc>, MessageId)> = None;
            let mut earliest: Option<DateTime<Utc>> = None;

            for entry in self.inner.entries.iter() {
                if matches!(entry.status, DeliveryStatus::InFlight) {
                    continue;
                }

                let key = (entry.next_attempt_at, *entry.key());
                if entry.next_attempt_at <= now {
                    if candidate.is_none_or(|current| key < current) {
                        candidate = Some(key);
                    }
                } else if earliest.is_none_or(|at| entry.next_attempt_at < at) {
                    earliest = Some(entry.next_attempt_at);
                }
            }

            let Some((_, id)) = candidate else {
                return Claim::Wait(earliest);
            };

            // the iterator's shard locks are released; another worker may
            // have claimed or removed this entry in between
            if let Some(mut entry) = self.inner.entries.get_mut(&id)
                && entry.is_eligible(now)
            {
                entry.status = DeliveryStatus::InFlight;
                return Claim::Ready(entry.clone());
            }
        }
    }

    /// Take the next eligible entry, waiting until one is due.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }

            match self.claim_next() {
                Claim::Ready(entry) => return Some(entry),
                Claim::Wait(Some(at)) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Claim::Wait(None) => notified.await,
            }
        }
    }

    /// Return an in-flight entry to the queue after a failed cycle.
    pub async fn reschedule(
        &self,
        mut entry: QueueEntry,
        next_attempt_at: DateTime<Utc>,
        last_error: impl Into<String>,
    ) -> Result<(), QueueError> {
        let id = entry.id();
        entry.status = DeliveryStatus::Retry {
            attempts: entry.cycles,
            last_error: last_error.into(),
        };
        entry.next_attempt_at = next_attempt_at;

        let persisted = self.inner.store.upsert(&id, &entry).await;

        // keep the in-memory copy authoritative even if the write failed, so
        // the entry is not stuck in flight
        self.inner.entries.insert(id, entry);
        self.inner.notify.notify_one();

        persisted.map_err(Into::into)
    }

    /// Remove a delivered entry.
    pub async fn complete(&self, id: &MessageId) -> Result<(), QueueError> {
        if self.inner.entries.remove(id).is_none() {
            return Err(QueueError::NotFound(*id));
        }
        self.release();

        match self.inner.store.delete(id).await {
            Ok(()) | Err(SpoolError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an entry to the dead-letter set.
    ///
    /// The message is also copied to the `.eml` archive when one is
    /// configured; a failure there is logged but does not fail the move.
    pub async fn dead_letter(
        &self,
        mut entry: QueueEntry,
        reason: impl Into<String>,
    ) -> Result<DeadLetter, QueueError> {
        let id = entry.id();
        let reason = reason.into();
        entry.status = DeliveryStatus::DeadLettered {
            reason: reason.clone(),
        };

        let dead = DeadLetter {
            entry,
            reason,
            dead_lettered_at: Utc::now(),
        };

        // written before the queue record is removed: a crash in between
        // leaves both, and restore keeps the dead letter
        self.inner.dead_store.upsert(&id, &dead).await?;

        if let Err(e) = self.inner.archive.store(&dead.entry.message).await {
            tracing::warn!(message_id = %id, error = %e, "Failed to archive dead letter");
        }

        if self.inner.entries.remove(&id).is_some() {
            self.release();
        }
        self.inner.dead.insert(id, dead.clone());

        match self.inner.store.delete(&id).await {
            Ok(()) | Err(SpoolError::NotFound(_)) => Ok(dead),
            Err(e) => Err(e.into()),
        }
    }

    /// Put a dead letter back in the queue with a fresh retry budget.
    ///
    /// Its attempt history is kept, as are the recipients already delivered
    /// to. Providers that refused it become eligible again.
    pub async fn requeue_dead_letter(&self, id: &MessageId) -> Result<QueueEntry, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let Some((_, dead)) = self.inner.dead.remove(id) else {
            return Err(QueueError::NotFound(*id));
        };

        if let Err(e) = self.reserve() {
            self.inner.dead.insert(*id, dead);
            return Err(e);
        }

        let mut entry = dead.entry.clone();
        entry.status = DeliveryStatus::Pending;
        entry.cycles = 0;
        entry.refused_by.clear();
        entry.next_attempt_at = Utc::now();

        if let Err(e) = self.inner.store.upsert(id, &entry).await {
            self.release();
            self.inner.dead.insert(*id, dead);
            return Err(e.into());
        }

        self.inner.entries.insert(*id, entry.clone());
        self.inner.notify.notify_one();

        if let Err(e) = self.inner.dead_store.delete(id).await
            && !matches!(e, SpoolError::NotFound(_))
        {
            tracing::warn!(message_id = %id, error = %e, "Failed to remove requeued dead letter from store");
        }

        if let Err(e) = self.inner.archive.remove(id).await {
            tracing::warn!(message_id = %id, error = %e, "Failed to remove archived copy");
        }

        Ok(entry)
    }

    /// Stop handing out entries and reject new ones.
    ///
    /// Every worker blocked in [`DeliveryQueue::dequeue`] is woken and gets
    /// `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Load persisted entries after a restart.
    ///
    /// Entries that were in flight when the process stopped are made
    /// eligible again immediately.
    pub async fn restore(&self) -> Result<RestoreSummary, QueueError> {
        let mut summary = RestoreSummary::default();
        let now = Utc::now();

        for id in self.inner.dead_store.list().await? {
            match self.inner.dead_store.read(&id).await {
                Ok(dead) => {
                    self.inner.dead.insert(id, dead);
                    summary.dead_lettered += 1;
                }
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "Skipping unreadable dead letter");
                    summary.skipped += 1;
                }
            }
        }

        for id in self.inner.store.list().await? {
            if self.inner.dead.contains_key(&id) {
                // dead-lettered just before a crash
                let _ = self.inner.store.delete(&id).await;
                continue;
            }

            if self.inner.entries.contains_key(&id) {
                continue;
            }

            let mut entry = match self.inner.store.read(&id).await {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "Skipping unreadable queue entry");
                    summary.skipped += 1;
                    continue;
                }
            };

            if matches!(entry.status, DeliveryStatus::InFlight) {
                entry.status = if entry.cycles == 0 {
                    DeliveryStatus::Pending
                } else {
                    DeliveryStatus::Retry {
                        attempts: entry.cycles,
                        last_error: entry.last_error().unwrap_or("interrupted").to_string(),
                    }
                };
                entry.next_attempt_at = entry.next_attempt_at.min(now);
            }

            self.inner.entries.insert(id, entry);
            // restored entries are admitted even beyond capacity
            self.inner.depth.fetch_add(1, Ordering::AcqRel);
            summary.queued += 1;
        }

        if summary.queued > 0 {
            self.inner.notify.notify_waiters();
            self.inner.notify.notify_one();
        }

        internal!(
            level = INFO,
            "Restored {} queued and {} dead-lettered messages ({} skipped)",
            summary.queued,
            summary.dead_lettered,
            summary.skipped
        );

        Ok(summary)
    }

    /// Write every entry and dead letter to the backing stores.
    ///
    /// In-flight entries are persisted as they were before being claimed, so
    /// a restart makes them eligible again.
    pub async fn persist_all(&self) -> Result<usize, QueueError> {
        let entries: Vec<QueueEntry> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let dead: Vec<DeadLetter> = self
            .inner
            .dead
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut persisted = 0;
        for entry in &entries {
            self.inner.store.upsert(&entry.id(), entry).await?;
            persisted += 1;
        }
        for dead in &dead {
            self.inner.dead_store.upsert(&dead.id(), dead).await?;
            persisted += 1;
        }

        Ok(persisted)
    }
}
