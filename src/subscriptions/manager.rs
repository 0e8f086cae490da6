//! Live subscriptions.
//!
//! The manager is an [`AppendListener`]: the store calls it after every
//! commit, in sequence order, and it copies matching events into each
//! subscriber's bounded queue. A full queue drops its oldest event and
//! records a gap, so a stalled subscriber never holds up the writer or
//! the other subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::Stream;

use super::slot::{Slot, StreamItem};
use crate::error::{BusError, BusResult};
use crate::events::{AppendListener, Event, EventFilter, EventStore};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

pub struct SubscriptionManager {
    slots: RwLock<HashMap<u64, Arc<Slot>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriptionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Start watching events appended from now on.
    pub fn subscribe(&self, filter: &EventFilter) -> BusResult<Subscription> {
        let compiled = filter.compile()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, compiled, self.capacity));

        self.slots
            .write()
            .map_err(|_| BusError::StoreUnavailable("subscription table poisoned".to_string()))?
            .insert(id, Arc::clone(&slot));

        tracing::debug!(subscriber = id, "Subscription registered");
        Ok(Subscription { slot })
    }

    /// Watch from `cursor`: stored events after it first, then live ones,
    /// without duplicates or reordering.
    pub fn subscribe_from(
        &self,
        store: &EventStore,
        filter: &EventFilter,
        cursor: u64,
    ) -> BusResult<Subscription> {
        let subscription = self.subscribe(filter)?;

        let mut backlog_filter = filter.clone();
        backlog_filter.after_seq = Some(backlog_filter.after_seq.unwrap_or(0).max(cursor));
        backlog_filter.limit = None;

        let backlog = match backlog_filter
            .compile()
            .map_err(BusError::from)
            .and_then(|compiled| store.query_compiled(&compiled))
        {
            Ok(backlog) => backlog,
            Err(e) => {
                self.unsubscribe(subscription.id());
                return Err(e);
            }
        };
        subscription.slot.prepend_backlog(backlog);
        Ok(subscription)
    }

    /// Tear down a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self
            .slots
            .write()
            .ok()
            .and_then(|mut slots| slots.remove(&id));
        match removed {
            Some(slot) => {
                slot.close();
                tracing::debug!(subscriber = id, "Subscription removed");
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .map(|slots| slots.values().filter(|s| s.is_live()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop slots whose handle has gone away.
    pub fn prune(&self) -> usize {
        let Ok(mut slots) = self.slots.write() else {
            return 0;
        };
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live());
        before - slots.len()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl AppendListener for SubscriptionManager {
    fn on_append(&self, event: &Arc<Event>) {
        let mut saw_dead = false;
        if let Ok(slots) = self.slots.read() {
            for slot in slots.values() {
                if slot.is_live() {
                    slot.offer(event);
                } else {
                    saw_dead = true;
                }
            }
        }
        if saw_dead {
            let pruned = self.prune();
            tracing::debug!(pruned, "Pruned closed subscriptions");
        }
    }
}

/// Handle to one live subscription. Dropping it ends the subscription.
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    pub fn filter(&self) -> &EventFilter {
        self.slot.filter().filter()
    }

    pub fn is_live(&self) -> bool {
        self.slot.is_live()
    }

    /// Events waiting to be read.
    pub fn queued(&self) -> usize {
        self.slot.queued()
    }

    /// Next item if one is ready.
    pub fn try_next(&mut self) -> Option<StreamItem> {
        self.slot.pop()
    }

    /// Wait for the next item. `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            if let Some(item) = self.slot.pop() {
                return Some(item);
            }
            if !self.slot.is_live() {
                return None;
            }
            self.slot.wait().await;
        }
    }

    /// View the subscription as a stream.
    pub fn into_stream(self) -> impl Stream<Item = StreamItem> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.close();
    }
}
