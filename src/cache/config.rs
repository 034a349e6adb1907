//! Cache configuration.
//!
//! Resolved from the `[cache]`, `[purge]` and `[vhost]` sections of
//! `cachegate.toml`; see `crate::config` for the raw layers.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::time::Duration;

use super::keys::ContentClass;

const DEFAULT_TTL_API_SECS: u64 = 30;
const DEFAULT_TTL_EXPRESS_SECS: u64 = 30;
const DEFAULT_TTL_BLOB_SECS: u64 = 86_400;
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_BODY_LIMIT_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_NODE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_QUEUE_LIMIT: usize = 10_000;

pub(crate) const DEFAULT_VARY_HEADERS: [&str; 2] = ["accept", "accept-encoding"];
pub(crate) const DEFAULT_BLOB_MARKERS: [&str; 3] = ["/@@images/", "/@@download/", "/@@display-file/"];
pub(crate) const DEFAULT_ELIGIBLE_TYPES: [&str; 5] =
    ["File", "Folder", "Image", "News Item", "Document"];

/// Per-class time to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassTtls {
    pub api: Duration,
    pub express: Duration,
    pub blob: Duration,
}

impl ClassTtls {
    pub fn for_class(&self, class: ContentClass) -> Duration {
        match class {
            ContentClass::Api => self.api,
            ContentClass::Express => self.express,
            ContentClass::Blob => self.blob,
        }
    }
}

impl Default for ClassTtls {
    fn default() -> Self {
        Self {
            api: Duration::from_secs(DEFAULT_TTL_API_SECS),
            express: Duration::from_secs(DEFAULT_TTL_EXPRESS_SECS),
            blob: Duration::from_secs(DEFAULT_TTL_BLOB_SECS),
        }
    }
}

/// Runtime cache and purge behaviour shared by every component of a node.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Serve and store responses from the local cache.
    pub enabled: bool,
    /// Accept `PURGE`/`BAN` and act on mutation events.
    pub purging_enabled: bool,
    pub ttl: ClassTtls,
    /// Upper bound on stored entries before LRU eviction.
    pub max_entries: usize,
    /// Responses larger than this are passed through uncached.
    pub body_limit_bytes: usize,
    /// Lowercase header names folded into every key.
    pub vary_headers: Vec<String>,
    /// Path fragments that mark derived media.
    pub blob_markers: Vec<String>,
    /// Content types whose mutations trigger purges.
    pub eligible_types: BTreeSet<String>,
    /// Per-node deadline for a broadcast call.
    pub node_timeout_ms: u64,
    /// Background drain interval for queued mutation events.
    pub auto_consume_interval_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Maximum queued events before new ones are dropped.
    pub queue_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            purging_enabled: true,
            ttl: ClassTtls::default(),
            max_entries: DEFAULT_MAX_ENTRIES,
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
            vary_headers: DEFAULT_VARY_HEADERS.iter().map(|h| h.to_string()).collect(),
            blob_markers: DEFAULT_BLOB_MARKERS.iter().map(|m| m.to_string()).collect(),
            eligible_types: DEFAULT_ELIGIBLE_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        let cache = &settings.cache;
        let purge = &settings.purge;
        Self {
            enabled: cache.enabled,
            purging_enabled: purge.enabled,
            ttl: ClassTtls {
                api: cache.ttl_api,
                express: cache.ttl_express,
                blob: cache.ttl_blob,
            },
            max_entries: cache.max_entries.get(),
            body_limit_bytes: cache.body_limit_bytes.get(),
            vary_headers: cache.vary_headers.clone(),
            blob_markers: cache.blob_markers.clone(),
            eligible_types: purge.eligible_types.clone(),
            node_timeout_ms: purge.node_timeout.as_millis() as u64,
            auto_consume_interval_ms: purge.auto_consume_interval.as_millis() as u64,
            consume_batch_limit: purge.consume_batch_limit.get(),
            queue_limit: purge.queue_limit.get(),
        }
    }
}

impl CacheConfig {
    /// TTL assigned to new entries of the given class.
    pub fn ttl_for(&self, class: ContentClass) -> Duration {
        self.ttl.for_class(class)
    }

    /// Whether a mutation of this content type should purge anything.
    pub fn is_purge_eligible(&self, content_type: &str) -> bool {
        self.eligible_types.contains(content_type)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert!(config.purging_enabled);
        assert_eq!(config.ttl_for(ContentClass::Api), Duration::from_secs(30));
        assert_eq!(config.ttl_for(ContentClass::Express), Duration::from_secs(30));
        assert_eq!(config.ttl_for(ContentClass::Blob), Duration::from_secs(86_400));
        assert_eq!(config.vary_headers, vec!["accept", "accept-encoding"]);
        assert_eq!(config.node_timeout(), Duration::from_millis(2_000));
    }

    #[test]
    fn blob_ttl_outlives_document_ttl() {
        let config = CacheConfig::default();
        assert!(config.ttl_for(ContentClass::Blob) > config.ttl_for(ContentClass::Express));
    }

    #[test]
    fn eligibility_is_an_exact_allow_list() {
        let config = CacheConfig::default();
        assert!(config.is_purge_eligible("Document"));
        assert!(config.is_purge_eligible("News Item"));
        assert!(!config.is_purge_eligible("document"));
        assert!(!config.is_purge_eligible("Event"));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }
}
