//! Cachegate cache system
//!
//! Each node owns an independent response store. Invalidation reaches the
//! other nodes through an explicit broadcaster:
//!
//! - **Store**: key → entry table with per-class TTLs, hit counts and LRU bound
//! - **Purge/Ban**: exact-path removal and predicate-based bulk removal
//! - **Broadcast**: concurrent fan-out of purges to every configured node
//! - **Auto-purge**: origin mutation events → planned paths → purge + broadcast
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `cachegate.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_entries = 10000
//!
//! [cache.ttl]
//! api = 30
//! express = 30
//! blob = 86400
//!
//! [purge]
//! enabled = true
//! eligible_types = ["File", "Folder", "Image", "News Item", "Document"]
//! # ... see config.rs for all options
//! ```

mod broadcast;
mod classifier;
mod config;
mod consumer;
mod events;
mod keys;
mod lock;
mod middleware;
mod planner;
mod predicate;
mod purge;
mod store;
mod trigger;
mod vhost;

pub use broadcast::{
    BroadcastReport, Broadcaster, HttpNodeClient, INVALIDATE_PATTERN_HEADER, LocalNodeClient,
    NodeClient, NodeError, NodeOutcome,
};
pub use classifier::{BypassReason, Classification, RequestClassifier, is_authenticated};
pub use config::{CacheConfig, ClassTtls};
pub use consumer::{ConsumptionReport, InvalidationConsumer};
pub use events::{CacheEvent, Epoch, EventQueue};
pub use keys::{CacheKey, ContentClass, normalize_path};
pub use middleware::{
    CacheState, X_AUTH, X_CACHE, X_HITS, X_REQTYPE, X_TTL, response_cache_layer,
    should_store_response,
};
pub use planner::InvalidationPlan;
pub use predicate::{BanPredicate, PredicateError};
pub use purge::{CacheNode, PurgeOutcome, ban, execute, flush, purge_exact};
pub use store::{CacheEntry, CacheHit, CacheStore, EntryMetadata, StoreStats, StoredResponse};
pub use trigger::InvalidationTrigger;
pub use vhost::VirtualHostRewrite;
