//! Debounced flush scheduling.
//!
//! Mutated entities are collected in a pending set keyed by soul. One timer
//! task sleeps until the quiet window after the most recent enqueue has
//! passed and then flushes the whole set, so a burst of writes to an entity
//! costs one backend write and one sync round. Failed flushes stay pending
//! with a retry count until `max_flush_retries` is reached.

use crate::entity::Entity;
use crate::session::SessionInner;
use soulstore_types::Soul;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, warn};

struct Pending {
    entity: Entity,
    retries: u32,
}

#[derive(Default)]
struct Queue {
    pending: BTreeMap<Soul, Pending>,
    deadline: Option<Instant>,
}

pub(crate) struct FlushScheduler {
    queue: Mutex<Queue>,
    notify: Notify,
    debounce: Duration,
    max_retries: u32,
}

impl FlushScheduler {
    pub fn new(debounce: Duration, max_retries: u32) -> Self {
        Self {
            queue: Mutex::default(),
            notify: Notify::new(),
            debounce,
            max_retries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an entity to the pending set and re-arms the timer.
    pub fn enqueue(&self, entity: &Entity) {
        let mut queue = self.lock();
        queue
            .pending
            .entry(entity.soul().clone())
            .or_insert_with(|| Pending {
                entity: entity.clone(),
                retries: 0,
            });
        queue.deadline = Some(Instant::now() + self.debounce);
        drop(queue);
        self.notify.notify_one();
    }

    /// Puts back an entity whose flush failed. Returns false once it has
    /// failed too often and was given up on.
    pub fn requeue_failed(&self, entity: Entity, retries: u32) -> bool {
        if retries >= self.max_retries {
            error!(
                "giving up on flushing {} after {retries} attempts",
                entity.soul()
            );
            return false;
        }
        let mut queue = self.lock();
        let slot = queue
            .pending
            .entry(entity.soul().clone())
            .or_insert(Pending { entity, retries: 0 });
        slot.retries = slot.retries.max(retries);
        queue.deadline = Some(Instant::now() + self.debounce);
        drop(queue);
        self.notify.notify_one();
        true
    }

    /// Keeps an entity pending without arming the timer. The next
    /// [`enqueue`](Self::enqueue) of it, or of anything else, flushes it.
    fn park(&self, entity: Entity, retries: u32) {
        self.lock()
            .pending
            .entry(entity.soul().clone())
            .or_insert(Pending { entity, retries });
    }

    pub fn remove(&self, soul: &Soul) {
        self.lock().pending.remove(soul);
    }

    /// The pending instance for `soul`, if it awaits a flush.
    pub fn get(&self, soul: &Soul) -> Option<Entity> {
        self.lock().pending.get(soul).map(|p| p.entity.clone())
    }

    pub fn is_pending(&self, soul: &Soul) -> bool {
        self.lock().pending.contains_key(soul)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn clear(&self) {
        let mut queue = self.lock();
        queue.pending.clear();
        queue.deadline = None;
    }

    /// Takes the whole pending set.
    fn drain(&self) -> Vec<(Entity, u32)> {
        let mut queue = self.lock();
        queue.deadline = None;
        std::mem::take(&mut queue.pending)
            .into_values()
            .map(|p| (p.entity, p.retries))
            .collect()
    }

    fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }
}

/// Flushes everything pending now. Returns the number of entities flushed
/// successfully and the first error met.
pub(crate) async fn flush_pending(
    session: &Arc<SessionInner>,
) -> (usize, Option<crate::EngineError>) {
    let batch = session.scheduler.drain();
    if batch.is_empty() {
        return (0, None);
    }
    debug!("flushing {} pending entities", batch.len());

    let mut flushed = 0;
    let mut first_error = None;
    for (entity, retries) in batch {
        if session.is_involved_in_transaction(entity.soul()) {
            // Held until the transaction commits or rolls back.
            session.scheduler.park(entity, retries);
            continue;
        }
        match session.flush_entity(&entity).await {
            Ok(()) => flushed += 1,
            Err(e) => {
                warn!("flush of {} failed (attempt {}): {e}", entity.soul(), retries + 1);
                session.scheduler.requeue_failed(entity, retries + 1);
                first_error.get_or_insert(e);
            }
        }
    }
    (flushed, first_error)
}

/// Timer task driving the debounced flush. Exits when the session is gone.
pub(crate) async fn run_timer(session: Weak<SessionInner>, scheduler: Arc<FlushScheduler>) {
    loop {
        let notified = scheduler.notify.notified();
        let Some(deadline) = scheduler.deadline() else {
            notified.await;
            continue;
        };
        tokio::select! {
            () = sleep_until(deadline) => {}
            () = notified => continue,
        }
        if scheduler.deadline().is_some_and(|d| d > Instant::now()) {
            // Re-armed while sleeping.
            continue;
        }
        let Some(session) = session.upgrade() else {
            return;
        };
        flush_pending(&session).await;
    }
}
