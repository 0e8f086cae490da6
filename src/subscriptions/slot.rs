//! Per-subscriber bounded queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::events::{CompiledFilter, Event};

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(Arc<Event>),
    /// Events were dropped because the subscriber fell behind.
    ///
    /// Everything dropped sorts after `resume_after`: re-running the
    /// subscription's filter as a query from there, up to the next event
    /// delivered, recovers what was missed.
    Gap { missed: u64, resume_after: u64 },
}

#[derive(Debug, Default)]
struct SlotQueue {
    events: VecDeque<Arc<Event>>,
    missed: u64,
    /// Sequence number just before the first event dropped in the current gap.
    resume_after: u64,
    /// Highest sequence number ever enqueued.
    last_seq: u64,
}

impl SlotQueue {
    fn enforce_capacity(&mut self, capacity: usize) -> u64 {
        let mut dropped = 0;
        while self.events.len() > capacity {
            if let Some(old) = self.events.pop_front() {
                if self.missed == 0 {
                    self.resume_after = old.seq.saturating_sub(1);
                }
                self.missed += 1;
                dropped += 1;
            }
        }
        dropped
    }
}

pub(crate) struct Slot {
    id: u64,
    filter: CompiledFilter,
    capacity: usize,
    queue: Mutex<SlotQueue>,
    notify: Notify,
    live: AtomicBool,
}

impl Slot {
    pub(crate) fn new(id: u64, filter: CompiledFilter, capacity: usize) -> Self {
        Self {
            id,
            filter,
            capacity: capacity.max(1),
            queue: Mutex::new(SlotQueue::default()),
            notify: Notify::new(),
            live: AtomicBool::new(true),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn filter(&self) -> &CompiledFilter {
        &self.filter
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop deliveries and wake any waiter so it can observe the close.
    pub(crate) fn close(&self) {
        self.live.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Offer a newly appended event. Never blocks on the consumer.
    pub(crate) fn offer(&self, event: &Arc<Event>) {
        if !self.is_live() || !self.filter.matches(event) {
            return;
        }
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        if event.seq <= queue.last_seq {
            return;
        }
        queue.last_seq = event.seq;
        queue.events.push_back(Arc::clone(event));
        if queue.enforce_capacity(self.capacity) > 0 {
            tracing::warn!(
                subscriber = self.id,
                missed = queue.missed,
                "Subscriber overflowed, dropping oldest events"
            );
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Merge catch-up events read from the store in front of anything that
    /// arrived live in the meantime.
    pub(crate) fn prepend_backlog(&self, backlog: Vec<Event>) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        let first_live = queue.events.front().map_or(u64::MAX, |e| e.seq);
        let older: Vec<Arc<Event>> = backlog
            .into_iter()
            .filter(|e| e.seq < first_live)
            .map(Arc::new)
            .collect();
        if older.is_empty() {
            return;
        }
        if let Some(max) = older.last().map(|e| e.seq) {
            queue.last_seq = queue.last_seq.max(max);
        }
        for event in older.into_iter().rev() {
            queue.events.push_front(event);
        }
        queue.enforce_capacity(self.capacity);
        drop(queue);
        self.notify.notify_one();
    }

    /// Next item without waiting. A pending gap comes before queued events.
    pub(crate) fn pop(&self) -> Option<StreamItem> {
        if !self.is_live() {
            return None;
        }
        let mut queue = self.queue.lock().ok()?;
        if queue.missed > 0 {
            let item = StreamItem::Gap {
                missed: queue.missed,
                resume_after: queue.resume_after,
            };
            queue.missed = 0;
            return Some(item);
        }
        queue.events.pop_front().map(StreamItem::Event)
    }

    pub(crate) async fn wait(&self) {
        self.notify.notified().await
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.events.len()).unwrap_or(0)
    }
}
