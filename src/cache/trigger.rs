//! Auto-purge trigger.
//!
//! Entry point for content mutation notifications: filters them against the
//! purge allow-list, queues them and optionally consumes immediately.

use std::sync::Arc;

use cachegate_api_types::{ContentMutationEvent, MutationResponse, MutationStatus};
use tracing::debug;

use super::config::CacheConfig;
use super::consumer::InvalidationConsumer;
use super::events::EventQueue;

pub struct InvalidationTrigger {
    config: CacheConfig,
    queue: Arc<EventQueue>,
    consumer: Arc<InvalidationConsumer>,
}

impl InvalidationTrigger {
    pub fn new(
        config: CacheConfig,
        queue: Arc<EventQueue>,
        consumer: Arc<InvalidationConsumer>,
    ) -> Self {
        Self {
            config,
            queue,
            consumer,
        }
    }

    /// Queue a mutation without consuming it.
    ///
    /// The background consumer picks it up on its next tick.
    pub fn enqueue(&self, event: ContentMutationEvent) -> MutationStatus {
        if !self.config.purging_enabled {
            debug!(path = %event.content_path, "Mutation skipped: purging disabled");
            return MutationStatus::Disabled;
        }
        if !self.config.is_purge_eligible(&event.content_type) {
            debug!(
                path = %event.content_path,
                content_type = %event.content_type,
                "Mutation skipped: content type not eligible"
            );
            return MutationStatus::Ignored;
        }
        debug!(
            path = %event.content_path,
            transitions = ?event.transitions,
            "Mutation queued"
        );
        if self.queue.publish(event) {
            MutationStatus::Queued
        } else {
            MutationStatus::Dropped
        }
    }

    /// Queue a mutation and consume the queue right away.
    pub async fn content_mutated(&self, event: ContentMutationEvent) -> MutationResponse {
        let status = self.enqueue(event);
        if status != MutationStatus::Queued {
            return MutationResponse {
                status,
                paths: Vec::new(),
                failed_nodes: Vec::new(),
            };
        }

        // A concurrent consumer may have taken the batch; the event is still handled.
        let report = self.consumer.consume().await.unwrap_or_default();
        MutationResponse {
            status: MutationStatus::Consumed,
            paths: report.paths(),
            failed_nodes: report.failed_nodes.into_iter().collect(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn consumer(&self) -> &Arc<InvalidationConsumer> {
        &self.consumer
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::cache::broadcast::Broadcaster;
    use crate::cache::keys::{CacheKey, ContentClass};
    use crate::cache::purge::CacheNode;
    use crate::cache::store::{CacheStore, EntryMetadata, StoredResponse};
    use crate::cache::vhost::VirtualHostRewrite;

    fn create_trigger(config: CacheConfig) -> (InvalidationTrigger, CacheNode) {
        let node = CacheNode::new("a", Arc::new(CacheStore::new(&config)));
        let queue = Arc::new(EventQueue::new(config.queue_limit));
        let consumer = Arc::new(InvalidationConsumer::new(
            config.clone(),
            VirtualHostRewrite::default(),
            node.clone(),
            Broadcaster::new(Vec::new(), Duration::from_secs(1)),
            queue.clone(),
        ));
        (InvalidationTrigger::new(config, queue, consumer), node)
    }

    fn put(node: &CacheNode, path: &str) {
        node.store().insert(
            CacheKey::new(path),
            StoredResponse {
                status: 200,
                headers: Vec::new(),
                body: Bytes::from_static(b"x"),
                content_type: None,
            },
            ContentClass::Express,
            EntryMetadata::new(),
        );
    }

    #[tokio::test]
    async fn eligible_mutation_is_consumed_immediately() {
        let (trigger, node) = create_trigger(CacheConfig::default());
        put(&node, "/page");
        put(&node, "/++api++/page");

        let response = trigger
            .content_mutated(ContentMutationEvent::new("/page", "Document"))
            .await;

        assert_eq!(response.status, MutationStatus::Consumed);
        assert!(response.paths.contains(&"/++api++/page".to_string()));
        assert!(trigger.queue().is_empty());
        assert!(node.store().is_empty());
    }

    #[tokio::test]
    async fn non_eligible_mutation_changes_nothing() {
        let (trigger, node) = create_trigger(CacheConfig::default());
        put(&node, "/event");

        let response = trigger
            .content_mutated(ContentMutationEvent::new("/event", "Event"))
            .await;

        assert_eq!(response.status, MutationStatus::Ignored);
        assert!(response.paths.is_empty());
        assert_eq!(node.store().len(), 1);
    }

    #[tokio::test]
    async fn disabled_purging_is_a_no_op() {
        let (trigger, node) = create_trigger(CacheConfig {
            purging_enabled: false,
            ..Default::default()
        });
        put(&node, "/page");

        let response = trigger
            .content_mutated(ContentMutationEvent::new("/page", "Document"))
            .await;

        assert_eq!(response.status, MutationStatus::Disabled);
        assert!(trigger.queue().is_empty());
        assert_eq!(node.store().len(), 1);
    }

    #[test]
    fn enqueue_defers_consumption() {
        let (trigger, _node) = create_trigger(CacheConfig::default());

        let status = trigger.enqueue(ContentMutationEvent::new("/page", "Document"));

        assert_eq!(status, MutationStatus::Queued);
        assert_eq!(trigger.queue().len(), 1);
    }

    #[test]
    fn full_queue_reports_dropped() {
        let (trigger, _node) = create_trigger(CacheConfig {
            queue_limit: 1,
            ..Default::default()
        });

        trigger.enqueue(ContentMutationEvent::new("/a", "Document"));
        let status = trigger.enqueue(ContentMutationEvent::new("/b", "Document"));

        assert_eq!(status, MutationStatus::Dropped);
    }
}
