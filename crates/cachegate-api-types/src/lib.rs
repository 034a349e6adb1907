//! Wire types shared by the cachegate server, its admin API and the purge protocol.
//!
//! Every type here is plain serde data; validation (for example parsing a ban
//! pattern) happens in the server at the boundary that receives it.

use serde::{Deserialize, Serialize};

/// Notification sent by the origin after a content write commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMutationEvent {
    /// Canonical path of the mutated content object, e.g. `/page`.
    pub content_path: String,
    /// Portal type of the object, matched against the purge allow-list.
    pub content_type: String,
    /// Workflow transitions applied as part of the write.
    #[serde(default)]
    pub transitions: Vec<String>,
    /// Derivative paths the origin wants purged explicitly (image scales, downloads).
    #[serde(default)]
    pub extra_paths: Vec<String>,
}

impl ContentMutationEvent {
    pub fn new(content_path: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_path: content_path.into(),
            content_type: content_type.into(),
            transitions: Vec::new(),
            extra_paths: Vec::new(),
        }
    }

    pub fn with_extra_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_transitions<I, S>(mut self, transitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transitions = transitions.into_iter().map(Into::into).collect();
        self
    }
}

/// A single invalidation instruction delivered to one or more cache nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PurgeRequest {
    /// Remove every variant of one path.
    Exact {
        #[serde(alias = "key")]
        path: String,
    },
    /// Remove every entry whose metadata satisfies the pattern.
    Ban {
        #[serde(alias = "predicate")]
        pattern: String,
    },
}

impl PurgeRequest {
    pub fn exact(path: impl Into<String>) -> Self {
        Self::Exact { path: path.into() }
    }

    pub fn ban(pattern: impl Into<String>) -> Self {
        Self::Ban {
            pattern: pattern.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exact { .. } => "exact",
            Self::Ban { .. } => "ban",
        }
    }
}

/// Body returned by a node for `PURGE` and `BAN`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeAck {
    /// Number of entries removed.
    pub removed: usize,
    /// True when an exact purge found nothing to remove.
    #[serde(default)]
    pub already_absent: bool,
}

/// Per-node line of a broadcast report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub address: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Result of fanning one purge request out to every configured node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReportBody {
    pub request: PurgeRequest,
    pub converged: bool,
    pub nodes: Vec<NodeReport>,
}

/// What happened to a mutation notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Purges were issued.
    Consumed,
    /// Queued for the next background consumption.
    Queued,
    /// The content type is not on the purge allow-list.
    Ignored,
    /// Purging is switched off.
    Disabled,
    /// The event queue was full.
    Dropped,
}

/// Response to `POST /_cache/events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub status: MutationStatus,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub failed_nodes: Vec<String>,
}

/// Response to `GET /_cache/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsBody {
    pub node_id: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub queued_events: usize,
}
