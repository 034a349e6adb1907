//! Mutation event queue.
//!
//! Content mutations reported by the origin are queued here before the
//! consumer turns them into purges.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use cachegate_api_types::ContentMutationEvent;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::MutexExt;

const SOURCE: &str = "cache::events";

const METRIC_QUEUE_LEN: &str = "cachegate_event_queue_len";
const METRIC_DROPPED: &str = "cachegate_event_dropped_total";

/// Monotonic epoch for ordering events.
///
/// When several events touch the same path, the one with the highest epoch
/// is the one the planner keeps.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    pub mutation: ContentMutationEvent,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(mutation: ContentMutationEvent, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            mutation,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Bounded in-memory queue of mutation events.
///
/// When full, new events are dropped and counted rather than blocking the
/// notifier.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a mutation. Returns `false` when the queue was full.
    pub fn publish(&self, mutation: ContentMutationEvent) -> bool {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(mutation, epoch);

        let mut queue = self.queue.lock_recovered(SOURCE, "publish");
        if queue.len() >= self.limit {
            drop(queue);
            warn!(
                event_id = %event.id,
                path = %event.mutation.content_path,
                limit = self.limit,
                "Event queue full, mutation dropped"
            );
            counter!(METRIC_DROPPED).increment(1);
            return false;
        }

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            path = %event.mutation.content_path,
            content_type = %event.mutation.content_type,
            "Mutation event enqueued"
        );
        queue.push_back(event);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        true
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = self.queue.lock_recovered(SOURCE, "drain");
        let count = limit.min(queue.len());
        let events: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        self.queue.lock_recovered(SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock_recovered(SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}
