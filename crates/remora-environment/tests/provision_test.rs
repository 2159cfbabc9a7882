// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning against the mock cluster: image cache, pod reuse, file sync,
//! readiness failures and cleanup.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use remora_environment::cluster::{Cluster, PodOutcome, pod_annotations};
use remora_environment::scm::SourceControl;
use remora_environment::{Error, MockCluster, MockEngine, ProvisionRequest};
use remora_protocol::RemoteSyncStrategy;
use remora_protocol::constants::{
    OWNER_ANNOTATION, REPO_ROOT, SYNC_SHA_ANNOTATION, URI_ANNOTATION,
};
use serde_json::json;

fn image_request() -> ProvisionRequest {
    ProvisionRequest::new(bar_descriptor()).with_strategy(RemoteSyncStrategy::Image)
}

// ============================================================================
// Image identity and cache
// ============================================================================

#[tokio::test]
async fn test_unchanged_tree_builds_once() {
    let env = TestEnv::new();
    let client = env.client();

    let first = client
        .provision(image_request().with_reuse(false))
        .await
        .unwrap();
    let second = client
        .provision(image_request().with_reuse(false))
        .await
        .unwrap();

    assert_eq!(first.uri(), second.uri());
    assert_ne!(first.process_uri(), second.process_uri());
    assert_eq!(env.engine.build_count(), 1);
    assert_eq!(env.engine.push_count(), 1);
    assert_eq!(env.cluster.create_count(), 2);
}

#[tokio::test]
async fn test_source_edit_changes_image_tag_only_under_image_strategy() {
    let env = TestEnv::new();
    let before = env.source();
    let after = env
        .source()
        .with_file(remora_server_path(), "fn main() { println!(\"v2\"); }\n");

    let image_before = env
        .client_with(before.clone(), CLIENT_A)
        .provision(image_request())
        .await
        .unwrap();
    let image_after = env
        .client_with(after.clone(), CLIENT_A)
        .provision(image_request())
        .await
        .unwrap();
    assert_ne!(image_before.uri(), image_after.uri());
    assert!(image_before.uri().ends_with(&before.sha().unwrap()));
    assert!(image_after.uri().ends_with(&after.sha().unwrap()));

    let container_request =
        || ProvisionRequest::new(bar_descriptor()).with_strategy(RemoteSyncStrategy::Container);
    let container_before = env
        .client_with(before.clone(), CLIENT_A)
        .provision(container_request())
        .await
        .unwrap();
    let container_after = env
        .client_with(after, CLIENT_A)
        .provision(container_request())
        .await
        .unwrap();
    assert_eq!(container_before.uri(), container_after.uri());
    assert!(container_before.uri().ends_with(&before.env_sha().unwrap()));

    // Two image builds plus one dependency-only build
    assert_eq!(env.engine.build_count(), 3);
}

#[tokio::test]
async fn test_tag_prefix_is_part_of_the_image() {
    let env = TestEnv::new();
    let handle = env
        .client()
        .provision(image_request().with_tag_prefix("bar-"))
        .await
        .unwrap();

    let sha = env.source().sha().unwrap();
    assert_eq!(handle.uri(), format!("{IMAGE_REPO}:bar-{sha}"));
    assert!(handle.process().name.starts_with("bar-"));
}

#[tokio::test]
async fn test_build_failure_creates_no_pod() {
    let mut env = TestEnv::new();
    env.engine = Arc::new(MockEngine::failing());

    let err = expect_err(env.client().provision(image_request()).await);
    assert!(matches!(err, Error::Build(_)));
    assert!(env.pods().await.is_empty());
    assert_eq!(env.cluster.create_count(), 0);
}

#[tokio::test]
async fn test_images_carry_resource_labels() {
    let env = TestEnv::new();
    env.client().provision(image_request()).await.unwrap();

    let builds = env.engine.builds().await;
    assert_eq!(builds.len(), 1);
    let labels = &builds[0].labels;
    assert_eq!(labels.get("name").map(String::as_str), Some("Bar"));
    assert_eq!(
        labels.get("server-path").map(String::as_str),
        Some("/app/crates/remora-server/src/bin/bar-server.rs")
    );
    assert!(builds[0].containerfile.contains("cargo fetch --locked"));
}

// ============================================================================
// Pod reuse
// ============================================================================

#[tokio::test]
async fn test_second_provision_reuses_pod() {
    let env = TestEnv::new();
    let client = env.client();

    let first = client.provision(image_request()).await.unwrap();
    let second = client.provision(image_request()).await.unwrap();

    assert_eq!(first.process_uri(), second.process_uri());
    assert_eq!(env.cluster.create_count(), 1);
    assert_eq!(env.pods().await.len(), 1);
}

#[tokio::test]
async fn test_pod_owned_by_another_client_is_reused() {
    let env = TestEnv::new();
    let a = env.client_with(env.source(), CLIENT_A);
    let b = env.client_with(env.source(), CLIENT_B);

    let first = a.provision(image_request()).await.unwrap();
    let second = b.provision(image_request()).await.unwrap();

    assert_eq!(first.process_uri(), second.process_uri());
    assert_eq!(second.client_id(), CLIENT_B);

    let pod = env
        .cluster
        .get_pod(NAMESPACE, &first.process().name)
        .await
        .unwrap()
        .unwrap();
    let annotations = pod_annotations(&pod);
    assert_eq!(annotations.get(OWNER_ANNOTATION).map(String::as_str), Some(CLIENT_A));
    assert_eq!(
        annotations.get(URI_ANNOTATION).map(String::as_str),
        Some(first.uri())
    );
}

#[tokio::test]
async fn test_reuse_disabled_creates_new_pod() {
    let env = TestEnv::new();
    let client = env.client();

    let first = client.provision(image_request()).await.unwrap();
    let second = client
        .provision(image_request().with_reuse(false))
        .await
        .unwrap();

    assert_ne!(first.process_uri(), second.process_uri());
    assert_eq!(env.pods().await.len(), 2);
}

#[tokio::test]
async fn test_registry_auth_is_ensured_per_provision() {
    let env = TestEnv::new();
    let client = env.client();
    client.provision(image_request()).await.unwrap();
    client.provision(image_request()).await.unwrap();
    assert_eq!(env.cluster.auth_count(), 2);
}

// ============================================================================
// Container strategy sync
// ============================================================================

#[tokio::test]
async fn test_new_container_pod_is_synced_and_annotated() {
    let env = TestEnv::new();
    let source = env.source();
    let handle = env
        .client()
        .provision(ProvisionRequest::new(bar_descriptor()))
        .await
        .unwrap();

    let archives = env.cluster.archives().await;
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].pod, handle.process().name);
    assert_eq!(archives[0].dest, REPO_ROOT);

    let pod = env
        .cluster
        .get_pod(NAMESPACE, &handle.process().name)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        pod_annotations(&pod).get(SYNC_SHA_ANNOTATION),
        Some(&source.sha().unwrap())
    );
}

#[tokio::test]
async fn test_reused_container_pod_syncs_only_when_stale() {
    let env = TestEnv::new();
    let request = || ProvisionRequest::new(bar_descriptor());

    let first = env.client().provision(request()).await.unwrap();
    assert_eq!(env.cluster.archives().await.len(), 1);

    // Unchanged tree: nothing to copy
    let again = env.client().provision(request()).await.unwrap();
    assert_eq!(again.process_uri(), first.process_uri());
    assert_eq!(env.cluster.archives().await.len(), 1);

    // Source edit keeps the env sha, so the same pod is reused and synced
    let edited = env
        .source()
        .with_file(remora_server_path(), "fn main() { println!(\"v2\"); }\n");
    let edited_sha = edited.sha().unwrap();
    let synced = env
        .client_with(edited, CLIENT_A)
        .provision(request())
        .await
        .unwrap();
    assert_eq!(synced.process_uri(), first.process_uri());
    assert_eq!(env.cluster.archives().await.len(), 2);
    assert_eq!(env.cluster.create_count(), 1);

    let pod = env
        .cluster
        .get_pod(NAMESPACE, &first.process().name)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pod_annotations(&pod).get(SYNC_SHA_ANNOTATION), Some(&edited_sha));
}

#[tokio::test]
async fn test_stale_sync_restarts_server_on_new_revision() {
    let env = TestEnv::new();
    let request = || ProvisionRequest::new(bar_descriptor());
    let source_sha = env.source().sha().unwrap();

    let first = env.client().provision(request()).await.unwrap();
    let name = first.process().name.clone();
    assert_eq!(env.cluster.server_starts(NAMESPACE, &name).await, 1);
    assert_eq!(first.info().await.unwrap().version, source_sha);

    // Reusing an up-to-date pod leaves its server alone
    env.client().provision(request()).await.unwrap();
    assert_eq!(env.cluster.server_starts(NAMESPACE, &name).await, 1);

    let edited = env
        .source()
        .with_file(remora_server_path(), "fn main() { println!(\"v3\"); }\n");
    let edited_sha = edited.sha().unwrap();
    let synced = env
        .client_with(edited, CLIENT_A)
        .provision(request())
        .await
        .unwrap();
    assert_eq!(synced.process().name, name);
    assert_eq!(env.cluster.server_starts(NAMESPACE, &name).await, 2);
    // The returned handle already talks to the restarted server
    assert_eq!(synced.info().await.unwrap().version, edited_sha);
    assert_eq!(first.info().await.unwrap().version, edited_sha);
}

#[tokio::test]
async fn test_image_strategy_never_syncs() {
    let env = TestEnv::new();
    env.client().provision(image_request()).await.unwrap();
    assert!(env.cluster.archives().await.is_empty());
}

#[tokio::test]
async fn test_sync_failure_removes_pod() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let mut cluster = MockCluster::with_backend(bar_backend(temp_dir.path().to_path_buf()));
    cluster.fail_copy = true;
    let env = TestEnv::with_cluster(cluster, temp_dir);

    let err = expect_err(
        env.client()
            .provision(ProvisionRequest::new(bar_descriptor()))
            .await,
    );
    assert!(matches!(err, Error::Sync(_)));
    assert!(env.pods().await.is_empty());
}

// ============================================================================
// Readiness failures
// ============================================================================

#[tokio::test]
async fn test_never_ready_pod_is_cleaned_up() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let env = TestEnv::with_cluster(MockCluster::never_ready(), temp_dir);

    let err = expect_err(
        env.client()
            .provision(image_request().with_params(json!({"a": "baz", "b": 1})))
            .await,
    );
    assert!(matches!(err, Error::PodNeverReady { .. }));
    assert_eq!(env.cluster.create_count(), 1);
    assert!(env.pods().await.is_empty());
    assert!(env.config_maps().await.is_empty());
}

#[tokio::test]
async fn test_container_pod_that_never_runs_is_cleaned_up() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let env = TestEnv::with_cluster(MockCluster::never_ready(), temp_dir);

    let err = expect_err(
        env.client()
            .provision(ProvisionRequest::new(bar_descriptor()))
            .await,
    );
    assert!(matches!(err, Error::PodNeverReady { .. }));
    assert!(env.cluster.archives().await.is_empty());
    assert!(env.pods().await.is_empty());
}

#[tokio::test]
async fn test_failed_pod_is_not_awaited() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let mut cluster = MockCluster::new();
    cluster.outcome = PodOutcome::Failed;
    let env = TestEnv::with_cluster(cluster, temp_dir);

    let started = std::time::Instant::now();
    let err = expect_err(env.client().provision(image_request()).await);
    assert!(matches!(err, Error::PodNeverReady { .. }));
    assert!(started.elapsed() < std::time::Duration::from_millis(450));
    assert!(env.pods().await.is_empty());
}

// ============================================================================
// Loading by URI
// ============================================================================

#[tokio::test]
async fn test_from_uri_requires_resource_labels() {
    let env = TestEnv::new();
    let client = env.client();

    let unknown = format!("{IMAGE_REPO}:never-built");
    let err = expect_err(client.from_uri(&unknown, None).await);
    assert!(matches!(err, Error::MissingLabels(_)));

    env.engine.insert_image(&unknown, BTreeMap::new()).await;
    let err = expect_err(client.from_uri(&unknown, None).await);
    assert!(matches!(err, Error::MissingLabels(_)));
    assert!(env.pods().await.is_empty());
}

#[tokio::test]
async fn test_from_uri_reuses_pod_of_stored_class() {
    let env = TestEnv::new();
    let client = env.client();
    let identity = client.store_cls(&bar_descriptor()).await.unwrap();

    let first = client.from_uri(&identity.reference(), None).await.unwrap();
    let second = client.from_uri(&identity.reference(), None).await.unwrap();
    assert_eq!(first.process_uri(), second.process_uri());
    assert_eq!(first.uri(), identity.reference());

    // Parameters always get a fresh instance
    let third = client
        .from_uri(&identity.reference(), Some(json!({"a": "x", "b": 2})))
        .await
        .unwrap();
    assert_ne!(third.process_uri(), first.process_uri());
}

#[tokio::test]
async fn test_from_uri_with_process_uri_attaches() {
    let env = TestEnv::new();
    let client = env.client();
    let handle = client.provision(image_request()).await.unwrap();

    let attached = client.from_uri(&handle.process_uri(), None).await.unwrap();
    assert_eq!(attached.process_uri(), handle.process_uri());
    assert_eq!(attached.uri(), handle.uri());
    assert_eq!(env.cluster.create_count(), 1);
}

#[tokio::test]
async fn test_store_cls_builds_without_starting() {
    let env = TestEnv::new();
    let client = env.client();

    let identity = client.store_cls(&bar_descriptor()).await.unwrap();
    assert_eq!(identity.tag, env.source().sha().unwrap());
    assert_eq!(env.engine.build_count(), 1);
    assert!(env.pods().await.is_empty());

    // Same tree, same image
    let again = client.store_cls(&bar_descriptor()).await.unwrap();
    assert_eq!(again, identity);
    assert_eq!(env.engine.build_count(), 1);
}

#[tokio::test]
async fn test_find_is_unsupported() {
    let env = TestEnv::new();
    let err = expect_err(env.client().find(&BTreeMap::new()).await);
    assert!(matches!(err, Error::Unsupported("find")));
}

fn remora_server_path() -> &'static str {
    use remora_server::Resource;
    remora_server::demo::Bar::SERVER_PATH
}
