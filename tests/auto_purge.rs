mod support;

use std::time::Duration;

use bytes::Bytes;
use cachegate::{
    application::Coordinator,
    cache::{CacheKey, ContentClass, EntryMetadata, StoredResponse},
};
use cachegate_api_types::{ContentMutationEvent, MutationStatus};

use support::settings;

fn page() -> StoredResponse {
    StoredResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "text/html".to_string())],
        body: Bytes::from_static(b"page"),
        content_type: Some("text/html".to_string()),
    }
}

fn seed(coordinator: &Coordinator, paths: &[&str]) {
    for path in paths {
        coordinator.node().store().insert(
            CacheKey::new(path),
            page(),
            ContentClass::Express,
            EntryMetadata::new().with("status", "200").with("url", *path),
        );
    }
}

#[tokio::test(start_paused = true)]
async fn queued_mutations_are_consumed_in_the_background() {
    let settings = settings(
        "a",
        "http://127.0.0.1:1/",
        "[purge]\nauto_consume_interval_ms = 100",
    );
    let coordinator = Coordinator::from_settings(&settings).expect("coordinator");
    seed(&coordinator, &["/page", "/++api++/page", "/other"]);

    let status = coordinator.trigger().enqueue(
        ContentMutationEvent::new("/page", "Document").with_transitions(["publish"]),
    );
    assert_eq!(status, MutationStatus::Queued);

    let tasks = coordinator.spawn_background();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let store = coordinator.node().store();
    assert!(coordinator.trigger().queue().is_empty());
    assert!(store.lookup(&CacheKey::new("/page")).is_none());
    assert!(store.lookup(&CacheKey::new("/++api++/page")).is_none());
    assert!(store.lookup(&CacheKey::new("/other")).is_some());

    tasks.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn nothing_is_consumed_before_the_first_interval() {
    let settings = settings(
        "a",
        "http://127.0.0.1:1/",
        "[purge]\nauto_consume_interval_ms = 1000",
    );
    let coordinator = Coordinator::from_settings(&settings).expect("coordinator");
    seed(&coordinator, &["/page"]);

    coordinator
        .trigger()
        .enqueue(ContentMutationEvent::new("/page", "Document"));
    let tasks = coordinator.spawn_background();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(coordinator.trigger().queue().len(), 1);
    assert_eq!(coordinator.node().store().len(), 1);

    tasks.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn extra_paths_are_purged_with_the_object() {
    let settings = settings("a", "http://127.0.0.1:1/", "");
    let coordinator = Coordinator::from_settings(&settings).expect("coordinator");
    seed(
        &coordinator,
        &["/page/logo.png", "/page/logo.png/@@images/image/icon"],
    );

    let response = coordinator
        .trigger()
        .content_mutated(
            ContentMutationEvent::new("/page/logo.png", "Image")
                .with_extra_paths(["/page/logo.png/@@images/image/icon"]),
        )
        .await;

    assert_eq!(response.status, MutationStatus::Consumed);
    assert!(
        response
            .paths
            .contains(&"/page/logo.png/@@images/image/icon".to_string())
    );
    assert!(coordinator.node().store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sweeper_drops_expired_entries() {
    let settings = settings(
        "a",
        "http://127.0.0.1:1/",
        "[cache]\nsweep_interval_secs = 10\n\n[cache.ttl]\nexpress = 5",
    );
    let coordinator = Coordinator::from_settings(&settings).expect("coordinator");
    seed(&coordinator, &["/page"]);
    coordinator.node().store().insert(
        CacheKey::new("/logo.png/@@images/image"),
        page(),
        ContentClass::Blob,
        EntryMetadata::new(),
    );

    let tasks = coordinator.spawn_background();
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(coordinator.node().store().len(), 1);

    tasks.shutdown().await;
}

#[tokio::test]
async fn disabled_purging_ignores_mutations() {
    let settings = settings("a", "http://127.0.0.1:1/", "[purge]\nenabled = false");
    let coordinator = Coordinator::from_settings(&settings).expect("coordinator");
    seed(&coordinator, &["/page"]);

    let response = coordinator
        .trigger()
        .content_mutated(ContentMutationEvent::new("/page", "Document"))
        .await;

    assert_eq!(response.status, MutationStatus::Disabled);
    assert_eq!(coordinator.node().store().len(), 1);
}
