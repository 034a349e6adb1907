//! Invalidation fan-out across cache nodes.
//!
//! Nodes do not share storage, so every purge is delivered to each configured
//! node independently. Calls run concurrently and each one is bounded by the
//! node timeout; a slow or dead node is reported failed without holding up
//! the others. Nothing is retried automatically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::HeaderValue;
use cachegate_api_types::{BroadcastReportBody, NodeReport, PurgeAck, PurgeRequest};
use futures::future::join_all;
use metrics::{counter, histogram};
use reqwest::{Client, Method, Url};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::purge::{self, CacheNode};

pub const INVALIDATE_PATTERN_HEADER: &str = "x-invalidate-pattern";

const METRIC_NODE_FAILURE: &str = "cachegate_broadcast_node_failure_total";
const METRIC_BROADCAST_MS: &str = "cachegate_broadcast_ms";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("node did not answer within {0:?}")]
    Timeout(Duration),
    #[error("node rejected the request with status {status}")]
    Rejected { status: u16 },
    #[error("invalid node address: {0}")]
    InvalidAddress(String),
    #[error("purge request cannot be sent: {0}")]
    InvalidRequest(String),
}

/// Transport to one cache node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn id(&self) -> &str;

    fn address(&self) -> &str;

    async fn send(&self, request: &PurgeRequest) -> Result<PurgeAck, NodeError>;
}

/// Delivers purges to a remote node's public listener as `PURGE`/`BAN`.
pub struct HttpNodeClient {
    id: String,
    address: Url,
    client: Client,
}

impl HttpNodeClient {
    pub fn new(id: impl Into<String>, address: Url, client: Client) -> Self {
        Self {
            id: id.into(),
            address,
            client,
        }
    }

    fn method(verb: &'static [u8]) -> Result<Method, NodeError> {
        Method::from_bytes(verb).map_err(|err| NodeError::InvalidRequest(err.to_string()))
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> &str {
        self.address.as_str()
    }

    async fn send(&self, request: &PurgeRequest) -> Result<PurgeAck, NodeError> {
        let builder = match request {
            PurgeRequest::Exact { path } => {
                let url = self
                    .address
                    .join(path)
                    .map_err(|err| NodeError::InvalidAddress(err.to_string()))?;
                self.client.request(Self::method(b"PURGE")?, url)
            }
            PurgeRequest::Ban { pattern } => {
                let url = self
                    .address
                    .join("/")
                    .map_err(|err| NodeError::InvalidAddress(err.to_string()))?;
                let value = HeaderValue::from_str(pattern)
                    .map_err(|err| NodeError::InvalidRequest(err.to_string()))?;
                self.client
                    .request(Self::method(b"BAN")?, url)
                    .header(INVALIDATE_PATTERN_HEADER, value)
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|err| NodeError::Unreachable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::Rejected {
                status: status.as_u16(),
            });
        }
        match response.json::<PurgeAck>().await {
            Ok(ack) => Ok(ack),
            Err(err) => {
                debug!(
                    node = %self.id,
                    error = %err,
                    "Node acknowledged without a readable body"
                );
                Ok(PurgeAck::default())
            }
        }
    }
}

/// Drives a node that lives in this process.
pub struct LocalNodeClient {
    node: CacheNode,
    address: String,
}

impl LocalNodeClient {
    pub fn new(node: CacheNode) -> Self {
        let address = format!("local://{}", node.id());
        Self { node, address }
    }
}

#[async_trait]
impl NodeClient for LocalNodeClient {
    fn id(&self) -> &str {
        self.node.id()
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, request: &PurgeRequest) -> Result<PurgeAck, NodeError> {
        purge::execute(&self.node, request).map_err(|_| NodeError::Rejected { status: 400 })
    }
}

#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub node_id: String,
    pub address: String,
    pub result: Result<PurgeAck, NodeError>,
    pub elapsed: Duration,
}

impl NodeOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastReport {
    pub request: PurgeRequest,
    pub outcomes: Vec<NodeOutcome>,
}

impl BroadcastReport {
    /// Every node acknowledged the request.
    pub fn converged(&self) -> bool {
        self.outcomes.iter().all(NodeOutcome::is_ok)
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_ok())
            .map(|outcome| outcome.node_id.as_str())
            .collect()
    }

    pub fn removed(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok())
            .map(|ack| ack.removed)
            .sum()
    }

    /// Fold the outcomes of a retry into this report, replacing each retried node's outcome.
    pub fn merge_retry(&mut self, retry: BroadcastReport) {
        for outcome in retry.outcomes {
            match self
                .outcomes
                .iter_mut()
                .find(|existing| existing.node_id == outcome.node_id)
            {
                Some(existing) => *existing = outcome,
                None => self.outcomes.push(outcome),
            }
        }
    }

    pub fn into_body(self) -> BroadcastReportBody {
        let converged = self.converged();
        let nodes = self
            .outcomes
            .into_iter()
            .map(|outcome| {
                let (ok, removed, error) = match outcome.result {
                    Ok(ack) => (true, Some(ack.removed), None),
                    Err(err) => (false, None, Some(err.to_string())),
                };
                NodeReport {
                    node_id: outcome.node_id,
                    address: outcome.address,
                    ok,
                    removed,
                    error,
                    elapsed_ms: outcome.elapsed.as_millis() as u64,
                }
            })
            .collect();
        BroadcastReportBody {
            request: self.request,
            converged,
            nodes,
        }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    nodes: Vec<Arc<dyn NodeClient>>,
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(nodes: Vec<Arc<dyn NodeClient>>, timeout: Duration) -> Self {
        Self { nodes, timeout }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Send the request to every node concurrently.
    pub async fn broadcast(&self, request: &PurgeRequest) -> BroadcastReport {
        self.send_to(self.nodes.iter(), request).await
    }

    /// Re-send to the nodes that failed in `report`. Successful nodes are left alone.
    pub async fn retry_failed(
        &self,
        report: &BroadcastReport,
        request: &PurgeRequest,
    ) -> BroadcastReport {
        let failed = report.failed_nodes();
        let targets = self
            .nodes
            .iter()
            .filter(|node| failed.contains(&node.id()));
        self.send_to(targets, request).await
    }

    async fn send_to<'a>(
        &self,
        nodes: impl Iterator<Item = &'a Arc<dyn NodeClient>>,
        request: &PurgeRequest,
    ) -> BroadcastReport {
        let started = Instant::now();
        let calls = nodes.map(|node| self.call(node.as_ref(), request));
        let outcomes = join_all(calls).await;

        histogram!(METRIC_BROADCAST_MS, "kind" => request.kind())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let report = BroadcastReport {
            request: request.clone(),
            outcomes,
        };
        info!(
            kind = request.kind(),
            nodes = report.outcomes.len(),
            failed = report.failed_nodes().len(),
            converged = report.converged(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Broadcast finished"
        );
        report
    }

    async fn call(&self, node: &dyn NodeClient, request: &PurgeRequest) -> NodeOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, node.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout(self.timeout)),
        };

        if let Err(err) = &result {
            warn!(
                node = node.id(),
                address = node.address(),
                error = %err,
                "Broadcast to node failed"
            );
            counter!(METRIC_NODE_FAILURE, "node" => node.id().to_string()).increment(1);
        }

        NodeOutcome {
            node_id: node.id().to_string(),
            address: node.address().to_string(),
            result,
            elapsed: started.elapsed(),
        }
    }
}
