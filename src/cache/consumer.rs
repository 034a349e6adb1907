//! Invalidation consumer.
//!
//! Drains mutation events from the queue, plans the affected paths, purges
//! them from the local store and then broadcasts the same purges to the
//! configured nodes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use cachegate_api_types::PurgeRequest;
use futures::future::join_all;
use metrics::histogram;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::broadcast::{BroadcastReport, Broadcaster};
use super::config::CacheConfig;
use super::events::EventQueue;
use super::planner::InvalidationPlan;
use super::purge::{self, CacheNode};
use super::vhost::VirtualHostRewrite;

const METRIC_CONSUME_MS: &str = "cachegate_consume_ms";

/// What one consumption pass did.
#[derive(Debug, Clone, Default)]
pub struct ConsumptionReport {
    pub event_count: usize,
    pub plan: InvalidationPlan,
    /// Entries removed from the local store.
    pub local_removed: usize,
    /// Nodes that failed at least one purge of this batch.
    pub failed_nodes: BTreeSet<String>,
}

impl ConsumptionReport {
    pub fn paths(&self) -> Vec<String> {
        self.plan.paths.iter().cloned().collect()
    }

    pub fn converged(&self) -> bool {
        self.failed_nodes.is_empty()
    }
}

pub struct InvalidationConsumer {
    config: CacheConfig,
    vhost: VirtualHostRewrite,
    node: CacheNode,
    broadcaster: Broadcaster,
    queue: Arc<EventQueue>,
}

impl InvalidationConsumer {
    pub fn new(
        config: CacheConfig,
        vhost: VirtualHostRewrite,
        node: CacheNode,
        broadcaster: Broadcaster,
        queue: Arc<EventQueue>,
    ) -> Self {
        Self {
            config,
            vhost,
            node,
            broadcaster,
            queue,
        }
    }

    /// Consume one batch of pending events.
    ///
    /// Returns `None` when the queue was empty.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> Option<ConsumptionReport> {
        let started_at = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit);
        if events.is_empty() {
            return None;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = InvalidationPlan::from_events(events, &self.config, &self.vhost);

        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Invalidation consumption starting"
        );

        let mut report = ConsumptionReport {
            event_count,
            ..Default::default()
        };

        if !plan.is_empty() {
            report.local_removed = plan
                .paths
                .iter()
                .map(|path| purge::purge_exact(&self.node, path).removed())
                .sum();

            let broadcasts = join_all(
                plan.paths
                    .iter()
                    .map(|path| self.broadcast_path(path.clone())),
            )
            .await;
            report.failed_nodes = broadcasts
                .iter()
                .flat_map(|b| b.failed_nodes())
                .map(str::to_string)
                .collect();
        }
        report.plan = plan;

        if !report.converged() {
            warn!(
                failed_nodes = ?report.failed_nodes,
                "Invalidation did not reach every node"
            );
        }
        info!(
            event_count,
            paths = report.plan.paths.len(),
            local_removed = report.local_removed,
            "Invalidation consumption complete"
        );
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        Some(report)
    }

    /// Drain the queue completely, one batch at a time.
    pub async fn consume_all(&self) -> Vec<ConsumptionReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.consume().await {
            reports.push(report);
        }
        reports
    }

    async fn broadcast_path(&self, path: String) -> BroadcastReport {
        self.broadcaster
            .broadcast(&PurgeRequest::Exact { path })
            .await
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}
