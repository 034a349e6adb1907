//! Node assembly.
//!
//! Builds one cache node from resolved settings: the store, the request
//! classifier, the mutation queue with its consumer and trigger, the
//! broadcasters and both routers. Background work (automatic consumption and
//! the expiry sweep) is spawned separately so callers decide when it starts.

use std::{sync::Arc, time::Duration};

use axum::Router;
use cachegate_api_types::PurgeRequest;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    cache::{
        BanPredicate, BroadcastReport, Broadcaster, CacheConfig, CacheNode, CacheState,
        CacheStore, EventQueue, HttpNodeClient, InvalidationConsumer, InvalidationTrigger,
        LocalNodeClient, NodeClient, RequestClassifier,
    },
    config::{NodeSettings, Settings},
    infra::{
        error::InfraError,
        http::{AdminState, PublicState, build_admin_router, build_public_router},
        origin::OriginClient,
    },
};

use super::error::AppError;

/// A fully wired cache node.
pub struct Coordinator {
    config: CacheConfig,
    node: CacheNode,
    queue: Arc<EventQueue>,
    trigger: Arc<InvalidationTrigger>,
    cluster: Broadcaster,
    public: PublicState,
    cache: CacheState,
    sweep_interval: Option<Duration>,
    startup_ban: Option<String>,
}

impl Coordinator {
    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let config = settings.cache_config();
        let vhost = settings.vhost_rewrite();

        let store = Arc::new(CacheStore::new(&config));
        let node = CacheNode::new(settings.server.node_id.clone(), store);

        let peers = node_clients(&settings.purge.nodes, Some(node.id()))?;
        let mut cluster_nodes: Vec<Arc<dyn NodeClient>> =
            vec![Arc::new(LocalNodeClient::new(node.clone()))];
        cluster_nodes.extend(peers.iter().cloned());
        let cluster = Broadcaster::new(cluster_nodes, config.node_timeout());

        let queue = Arc::new(EventQueue::new(config.queue_limit));
        let consumer = Arc::new(InvalidationConsumer::new(
            config.clone(),
            vhost.clone(),
            node.clone(),
            Broadcaster::new(peers, config.node_timeout()),
            queue.clone(),
        ));
        let trigger = Arc::new(InvalidationTrigger::new(
            config.clone(),
            queue.clone(),
            consumer,
        ));

        let origin = OriginClient::new(settings.origin.url.clone(), settings.origin.timeout)?;
        let classifier = Arc::new(RequestClassifier::new(&config, vhost.marker()));

        let public = PublicState {
            config: config.clone(),
            node: node.clone(),
            origin,
            request_body_limit: settings.server.request_body_limit.get(),
        };
        let cache = CacheState {
            config: config.clone(),
            node: node.clone(),
            classifier,
        };

        info!(
            node = node.id(),
            peers = cluster.node_count() - 1,
            cache_enabled = config.enabled,
            purging_enabled = config.purging_enabled,
            origin = %settings.origin.url,
            "Cache node assembled"
        );

        Ok(Self {
            config,
            node,
            queue,
            trigger,
            cluster,
            public,
            cache,
            sweep_interval: settings.cache.sweep_interval,
            startup_ban: settings.purge.startup_ban.clone(),
        })
    }

    pub fn node(&self) -> &CacheNode {
        &self.node
    }

    pub fn trigger(&self) -> &Arc<InvalidationTrigger> {
        &self.trigger
    }

    /// Broadcaster over this node and every configured peer.
    pub fn cluster(&self) -> &Broadcaster {
        &self.cluster
    }

    pub fn public_router(&self) -> Router {
        build_public_router(self.public.clone(), self.cache.clone())
    }

    pub fn admin_router(&self) -> Router {
        build_admin_router(AdminState {
            node: self.node.clone(),
            trigger: self.trigger.clone(),
            broadcaster: self.cluster.clone(),
            queue: self.queue.clone(),
        })
    }

    /// Start automatic consumption and, when configured, the expiry sweep.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let mut handles = Vec::with_capacity(2);

        if self.config.purging_enabled {
            let consumer = self.trigger.consumer().clone();
            let period = Duration::from_millis(self.config.auto_consume_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(report) = consumer.consume().await else {
                        continue;
                    };
                    if !report.converged() {
                        warn!(
                            failed = ?report.failed_nodes,
                            paths = report.plan.paths.len(),
                            "Automatic invalidation did not reach every node"
                        );
                    }
                }
            }));
        }

        if let Some(period) = self.sweep_interval {
            let store = self.node.store().clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let removed = store.sweep_expired();
                    if removed > 0 {
                        debug!(removed, remaining = store.len(), "Expired entries swept");
                    }
                }
            }));
        }

        BackgroundTasks { handles }
    }

    /// Broadcast the configured startup ban, if any, across the cluster.
    pub async fn run_startup_ban(&self) -> Option<BroadcastReport> {
        let pattern = self.startup_ban.as_ref()?;
        let report = self.cluster.broadcast(&PurgeRequest::ban(pattern.clone())).await;
        if report.converged() {
            info!(pattern = %pattern, removed = report.removed(), "Startup ban applied");
        } else {
            warn!(
                pattern = %pattern,
                failed = ?report.failed_nodes(),
                "Startup ban did not reach every node"
            );
        }
        Some(report)
    }
}

/// Handles for the node's background loops.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// HTTP clients for the configured nodes, skipping `exclude` when given.
pub fn node_clients(
    nodes: &[NodeSettings],
    exclude: Option<&str>,
) -> Result<Vec<Arc<dyn NodeClient>>, AppError> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|err| InfraError::http_client(err.to_string()))?;

    Ok(nodes
        .iter()
        .filter(|node| Some(node.id.as_str()) != exclude)
        .map(|node| {
            Arc::new(HttpNodeClient::new(
                node.id.clone(),
                node.address.clone(),
                client.clone(),
            )) as Arc<dyn NodeClient>
        })
        .collect())
}

/// Send one purge request to every configured node, retrying failed nodes once when asked.
pub async fn broadcast_to_nodes(
    settings: &Settings,
    request: PurgeRequest,
    retry: bool,
) -> Result<BroadcastReport, AppError> {
    if settings.purge.nodes.is_empty() {
        return Err(AppError::validation(
            "no cache nodes configured; set purge.nodes or pass --node id=url",
        ));
    }
    if let PurgeRequest::Ban { pattern } = &request {
        BanPredicate::parse(pattern).map_err(|err| AppError::validation(err.to_string()))?;
    }

    let broadcaster = Broadcaster::new(
        node_clients(&settings.purge.nodes, None)?,
        settings.purge.node_timeout,
    );

    let mut report = broadcaster.broadcast(&request).await;
    if retry && !report.converged() {
        let retried = broadcaster.retry_failed(&report, &request).await;
        report.merge_retry(retried);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn settings(extra: &str) -> Settings {
        config::from_toml(&format!(
            r#"
            [server]
            node_id = "cache-a"

            [origin]
            url = "http://127.0.0.1:1/"

            {extra}
            "#
        ))
        .expect("valid settings")
    }

    #[tokio::test]
    async fn cluster_includes_self_and_excludes_own_entry() {
        let settings = settings(
            r#"
            [[purge.nodes]]
            id = "cache-a"
            address = "http://127.0.0.1:3000/"

            [[purge.nodes]]
            id = "cache-b"
            address = "http://127.0.0.1:3100/"
            "#,
        );

        let coordinator = Coordinator::from_settings(&settings).expect("coordinator");
        assert_eq!(coordinator.node().id(), "cache-a");
        assert_eq!(coordinator.cluster().node_count(), 2);
    }

    #[tokio::test]
    async fn startup_ban_is_skipped_when_unset() {
        let coordinator = Coordinator::from_settings(&settings("")).expect("coordinator");
        assert!(coordinator.run_startup_ban().await.is_none());
    }

    #[tokio::test]
    async fn startup_ban_clears_the_local_store() {
        use crate::cache::{CacheKey, ContentClass, EntryMetadata, StoredResponse};

        let coordinator = Coordinator::from_settings(&settings(
            r#"
            [purge]
            startup_ban = "obj.status != 0"
            "#,
        ))
        .expect("coordinator");

        let store = coordinator.node().store();
        store.insert(
            CacheKey::new("/page"),
            StoredResponse {
                status: 200,
                headers: Vec::new(),
                body: bytes::Bytes::from_static(b"page"),
                content_type: None,
            },
            ContentClass::Express,
            EntryMetadata::new().with("status", "200"),
        );

        let report = coordinator.run_startup_ban().await.expect("report");
        assert!(report.converged());
        assert_eq!(report.removed(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn background_tasks_follow_configuration() {
        let enabled = Coordinator::from_settings(&settings("")).expect("coordinator");
        let tasks = enabled.spawn_background();
        assert_eq!(tasks.len(), 2);
        tasks.shutdown().await;

        let disabled = Coordinator::from_settings(&settings(
            r#"
            [cache]
            sweep_interval_secs = 0

            [purge]
            enabled = false
            "#,
        ))
        .expect("coordinator");
        assert!(disabled.spawn_background().is_empty());
    }

    #[tokio::test]
    async fn cli_broadcast_requires_nodes() {
        let err = broadcast_to_nodes(&settings(""), PurgeRequest::exact("/page"), false)
            .await
            .expect_err("no nodes");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn cli_broadcast_rejects_malformed_ban() {
        let settings = settings(
            r#"
            [[purge.nodes]]
            id = "cache-b"
            address = "http://127.0.0.1:1/"
            "#,
        );
        let err = broadcast_to_nodes(&settings, PurgeRequest::ban("obj.status =="), false)
            .await
            .expect_err("malformed ban");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
