//! Purge and ban against one node's store.

use std::sync::Arc;

use cachegate_api_types::{PurgeAck, PurgeRequest};
use tracing::info;

use super::keys::normalize_path;
use super::predicate::{BanPredicate, PredicateError};
use super::store::CacheStore;

/// One cache node: an identity plus the store it owns.
#[derive(Clone)]
pub struct CacheNode {
    id: String,
    store: Arc<CacheStore>,
}

impl CacheNode {
    pub fn new(id: impl Into<String>, store: Arc<CacheStore>) -> Self {
        Self {
            id: id.into(),
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged(usize),
    AlreadyAbsent,
}

impl PurgeOutcome {
    pub fn removed(&self) -> usize {
        match self {
            PurgeOutcome::Purged(count) => *count,
            PurgeOutcome::AlreadyAbsent => 0,
        }
    }
}

impl From<PurgeOutcome> for PurgeAck {
    fn from(outcome: PurgeOutcome) -> Self {
        PurgeAck {
            removed: outcome.removed(),
            already_absent: outcome == PurgeOutcome::AlreadyAbsent,
        }
    }
}

/// Remove every variant stored under `path`. Absent paths are not an error.
pub fn purge_exact(node: &CacheNode, path: &str) -> PurgeOutcome {
    let path = normalize_path(path);
    let removed = node.store.remove_path(&path);
    info!(node = %node.id, path = %path, removed, "Exact purge applied");
    if removed == 0 {
        PurgeOutcome::AlreadyAbsent
    } else {
        PurgeOutcome::Purged(removed)
    }
}

/// Remove every entry whose metadata satisfies the predicate.
pub fn ban(node: &CacheNode, predicate: &BanPredicate) -> usize {
    let removed = node
        .store
        .remove_where(|entry| predicate.matches(&entry.metadata));
    info!(node = %node.id, pattern = %predicate, removed, "Ban applied");
    removed
}

pub fn flush(node: &CacheNode) -> usize {
    let removed = node.store.flush();
    info!(node = %node.id, removed, "Store flushed");
    removed
}

/// Apply a wire request. Ban patterns are parsed before anything is removed.
pub fn execute(node: &CacheNode, request: &PurgeRequest) -> Result<PurgeAck, PredicateError> {
    match request {
        PurgeRequest::Exact { path } => Ok(purge_exact(node, path).into()),
        PurgeRequest::Ban { pattern } => {
            let predicate = BanPredicate::parse(pattern)?;
            Ok(PurgeAck {
                removed: ban(node, &predicate),
                already_absent: false,
            })
        }
    }
}
