//! Invalidation plan generation.
//!
//! Merges a batch of mutation events into the set of paths to purge.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use tracing::debug;

use super::config::CacheConfig;
use super::events::CacheEvent;
use super::keys::normalize_path;
use super::vhost::VirtualHostRewrite;

/// Paths to purge for one batch of events.
///
/// Only addressed paths are planned. Derivatives such as image scales are
/// purged when the origin lists them in `extra_paths`, never by enumeration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Normalized store paths, ordered for stable logs and broadcasts.
    pub paths: BTreeSet<String>,
    /// Distinct content objects the plan covers.
    pub objects: usize,
    /// Events dropped because their content type is not eligible.
    pub skipped: usize,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ paths: {}, objects: {}, skipped: {} }}",
            self.paths.len(),
            self.objects,
            self.skipped,
        )
    }
}

impl InvalidationPlan {
    /// Merge events into a plan.
    ///
    /// - Deduplicates by event ID
    /// - Groups by content path, keeping the latest epoch
    /// - Keeps the `extra_paths` of every grouped event, not just the latest
    /// - Expands each path into its canonical, API and virtual-hosted forms
    pub fn from_events(
        events: Vec<CacheEvent>,
        config: &CacheConfig,
        vhost: &VirtualHostRewrite,
    ) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();
        let mut latest: HashMap<String, CacheEvent> = HashMap::new();
        let mut extras: HashMap<String, BTreeSet<String>> = HashMap::new();

        for event in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
            if !config.is_purge_eligible(&event.mutation.content_type) {
                debug!(
                    event_id = %event.id,
                    content_type = %event.mutation.content_type,
                    "Mutation of non-eligible content type skipped"
                );
                plan.skipped += 1;
                continue;
            }

            let canonical = normalize_path(&vhost.canonical(&event.mutation.content_path));
            extras.entry(canonical.clone()).or_default().extend(
                event
                    .mutation
                    .extra_paths
                    .iter()
                    .filter(|p| !p.trim().is_empty())
                    .map(|p| normalize_path(p)),
            );
            latest
                .entry(canonical)
                .and_modify(|kept| {
                    if event.epoch > kept.epoch {
                        *kept = event.clone();
                    }
                })
                .or_insert(event);
        }

        plan.objects = latest.len();
        for (canonical, event) in latest {
            let api = normalize_path(&vhost.api_path(&canonical));
            let hosted = normalize_path(&vhost.translate(&api));
            let extra = extras.remove(&canonical).unwrap_or_default();
            debug!(
                path = %canonical,
                epoch = event.epoch,
                extra_paths = extra.len(),
                "Object planned for invalidation"
            );
            plan.paths.extend(extra);
            plan.paths.insert(canonical);
            plan.paths.insert(api);
            plan.paths.insert(hosted);
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cachegate_api_types::ContentMutationEvent;

    use super::*;
    use crate::cache::vhost::DEFAULT_PREFIX;

    fn make_event(path: &str, content_type: &str, epoch: u64) -> CacheEvent {
        CacheEvent::new(ContentMutationEvent::new(path, content_type), epoch)
    }

    fn plan(events: Vec<CacheEvent>) -> InvalidationPlan {
        InvalidationPlan::from_events(
            events,
            &CacheConfig::default(),
            &VirtualHostRewrite::default(),
        )
    }

    #[test]
    fn document_expands_to_three_forms() {
        let plan = plan(vec![make_event("/page", "Document", 0)]);

        let expected: BTreeSet<String> = [
            "/page".to_string(),
            "/++api++/page".to_string(),
            format!("{DEFAULT_PREFIX}/page"),
        ]
        .into_iter()
        .collect();
        assert_eq!(plan.paths, expected);
        assert_eq!(plan.objects, 1);
    }

    #[test]
    fn api_prefixed_event_path_is_canonicalized() {
        let from_api = plan(vec![make_event("/++api++/page/", "Document", 0)]);
        let from_canonical = plan(vec![make_event("/page", "Document", 0)]);
        assert_eq!(from_api.paths, from_canonical.paths);
    }

    #[test]
    fn non_eligible_types_plan_nothing() {
        let plan = plan(vec![make_event("/event", "Event", 0)]);
        assert!(plan.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn duplicate_ids_are_merged() {
        let event = make_event("/page", "Document", 0);
        let plan = plan(vec![event.clone(), event]);
        assert_eq!(plan.objects, 1);
        assert_eq!(plan.paths.len(), 3);
    }

    #[test]
    fn extra_paths_of_merged_events_are_all_purged() {
        let older = CacheEvent::new(
            ContentMutationEvent::new("/page", "Image")
                .with_extra_paths(["/page/@@images/image/old"]),
            1,
        );
        let newer = CacheEvent::new(
            ContentMutationEvent::new("/page", "Image")
                .with_extra_paths(["/page/@@images/image/new"]),
            2,
        );

        let plan = plan(vec![older, newer]);
        assert_eq!(plan.objects, 1);
        assert!(plan.paths.contains("/page/@@images/image/new"));
        assert!(plan.paths.contains("/page/@@images/image/old"));
        assert_eq!(plan.paths.len(), 5);
    }

    #[test]
    fn derivatives_are_not_enumerated() {
        let plan = plan(vec![make_event("/page/logo.png", "Image", 0)]);
        assert!(
            plan.paths.iter().all(|p| !p.contains("@@images")),
            "scales are only purged when listed explicitly"
        );
    }

    #[test]
    fn root_object_maps_to_api_root() {
        let plan = plan(vec![make_event("/", "Folder", 0)]);
        assert!(plan.paths.contains("/"));
        assert!(plan.paths.contains("/++api++"));
        assert!(plan.paths.contains(DEFAULT_PREFIX));
    }
}
