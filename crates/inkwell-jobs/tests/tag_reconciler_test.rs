//! Tag resolution and linking against the in-memory tag store.

mod support;

use std::sync::Arc;

use inkwell_core::{CreatePageRequest, Error, PageRepository};
use inkwell_jobs::TagReconciler;
use support::MemoryStore;

async fn page_in(store: &MemoryStore) -> uuid::Uuid {
    store
        .create(CreatePageRequest {
            image_url: "/uploads/p.jpg".to_string(),
            image_ref: "p.jpg".to_string(),
            metadata: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_resolve_is_stable_across_calls() {
    let store = MemoryStore::new();
    let reconciler = TagReconciler::new(store.clone());

    let first = reconciler.resolve("Work").await.unwrap();
    let second = reconciler.resolve("  WORK ").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.name, "work");
    assert_eq!(store.tag_names(), vec!["work"]);
}

#[tokio::test]
async fn test_resolve_rejects_blank_names() {
    let reconciler = TagReconciler::new(MemoryStore::new());
    let err = reconciler.resolve("   ").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_resolve_truncates_long_names() {
    let store = MemoryStore::new();
    let reconciler = TagReconciler::new(store.clone());

    let tag = reconciler.resolve(&"x".repeat(150)).await.unwrap();
    assert_eq!(tag.name.chars().count(), 100);
}

#[tokio::test]
async fn test_resolve_retries_when_row_vanishes() {
    let store = MemoryStore::new();
    store.vanish_tags_for_rounds(2);
    let reconciler = TagReconciler::new(store.clone());

    let tag = reconciler.resolve("ideas").await.unwrap();
    assert_eq!(tag.name, "ideas");
}

#[tokio::test]
async fn test_resolve_gives_up_after_max_attempts() {
    let store = MemoryStore::new();
    store.vanish_tags_for_rounds(3);
    let reconciler = TagReconciler::new(store.clone());

    let err = reconciler.resolve("ideas").await.unwrap_err();
    assert!(matches!(err, Error::Conflict(ref m) if m.contains("3 attempts")));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_reconcile_links_once() {
    let store = MemoryStore::new();
    let page_id = page_in(&store).await;
    let reconciler = TagReconciler::new(store.clone());

    let tags = reconciler
        .reconcile(page_id, &["Home".to_string(), "home".to_string(), "Garden".to_string()])
        .await
        .unwrap();
    assert_eq!(tags.len(), 2);

    // Replay adds nothing.
    reconciler
        .reconcile(page_id, &["home".to_string(), "garden".to_string()])
        .await
        .unwrap();
    assert_eq!(store.link_count(), 2);
    assert_eq!(store.tag_names_for(page_id), vec!["garden", "home"]);
}

#[tokio::test]
async fn test_concurrent_resolution_creates_one_row() {
    let store = MemoryStore::new();
    let reconciler = Arc::new(TagReconciler::new(store.clone()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let reconciler = reconciler.clone();
            let raw = if i % 2 == 0 { "Work" } else { " work" };
            tokio::spawn(async move { reconciler.resolve(raw).await })
        })
        .collect();

    let mut ids = Vec::new();
    for result in futures::future::join_all(handles).await {
        ids.push(result.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.tag_names(), vec!["work"]);
}
