// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storing running instances as images and loading them back.

mod common;

use std::io::Read;

use common::*;
use remora_environment::cluster::SnapshotOutcome;
use remora_environment::cluster::manifest::SNAPSHOT_DIR;
use remora_environment::lifecycle::SNAPSHOT_CONTAINERFILE;
use remora_environment::{Error, MockCluster, ProvisionRequest, RemoteResource};
use remora_protocol::RemoteSyncStrategy;
use remora_server::demo::{BarParams, EchoArgs};
use serde_json::{Value, json};

async fn bar(env: &TestEnv) -> RemoteResource {
    let request = ProvisionRequest::new(bar_descriptor())
        .with_strategy(RemoteSyncStrategy::Image)
        .with_params(json!({"a": "baz", "b": 1}));
    env.client().provision(request).await.unwrap()
}

async fn echo(handle: &RemoteResource) -> String {
    handle
        .call(
            "echo",
            &EchoArgs {
                txt: "x".to_string(),
            },
        )
        .await
        .unwrap()
}

/// Do what the snapshot builder does to the image: carry the saved state over.
async fn publish_snapshot(env: &TestEnv, handle: &RemoteResource, image: &str) {
    let from = artifact_dir(&env.root, handle.uri()).join("bar.json");
    let to = artifact_dir(&env.root, image);
    std::fs::create_dir_all(&to).unwrap();
    std::fs::copy(from, to.join("bar.json")).unwrap();
    env.engine
        .insert_image(image, handle.labels().as_map().clone())
        .await;
}

#[tokio::test]
async fn test_stored_instance_loads_with_its_state() {
    let env = TestEnv::new();
    let handle = bar(&env).await;
    let _: Value = handle
        .call(
            "set",
            &BarParams {
                a: "spam".into(),
                b: 4,
            },
        )
        .await
        .unwrap();

    let stored = handle.store().await.unwrap();
    assert!(stored.tag.starts_with("bar-"));
    assert_eq!(stored.repository_reference(), IMAGE_REPO);

    publish_snapshot(&env, &handle, &stored.reference()).await;
    let restored = env
        .client()
        .from_uri(&stored.reference(), None)
        .await
        .unwrap();

    assert_ne!(restored.process_uri(), handle.process_uri());
    assert_eq!(restored.uri(), stored.reference());
    assert_eq!(echo(&restored).await, "x -- hello! a: spam b: 4");
    // The source instance is untouched
    assert_eq!(echo(&handle).await, "x -- hello! a: spam b: 4");
}

#[tokio::test]
async fn test_snapshot_builder_gets_layered_build_context() {
    let env = TestEnv::new();
    let handle = bar(&env).await;
    let stored = handle.store().await.unwrap();
    let pod = handle.process().name.clone();

    // State and sources staged inside the server container
    let execs = env.cluster.execs().await;
    assert_eq!(execs.len(), 1);
    assert!(execs[0].join(" ").contains(SNAPSHOT_DIR));

    let archives = env.cluster.archives().await;
    let archive = archives
        .iter()
        .find(|a| a.dest == SNAPSHOT_DIR)
        .expect("containerfile copied into the snapshot volume");
    assert_eq!(archive.pod, pod);
    let mut tar = tar::Archive::new(&archive.archive[..]);
    let mut entry = tar.entries().unwrap().next().unwrap().unwrap();
    assert_eq!(
        entry.path().unwrap().to_string_lossy(),
        SNAPSHOT_CONTAINERFILE
    );
    let mut containerfile = String::new();
    entry.read_to_string(&mut containerfile).unwrap();
    assert!(containerfile.starts_with(&format!("FROM {}", handle.uri())));

    let builders = env.cluster.ephemeral_containers(NAMESPACE, &pod).await;
    assert_eq!(builders.len(), 1);
    assert!(builders[0].name.starts_with("snapshot-"));
    let args = builders[0].args.clone().unwrap_or_default();
    assert!(args.contains(&format!("--destination={}", stored.reference())));
    assert!(args.iter().any(|a| a == "--label=name=Bar"));
}

#[tokio::test]
async fn test_failed_snapshot_reports_builder_termination() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let mut cluster = MockCluster::with_backend(bar_backend(temp_dir.path().to_path_buf()));
    cluster.snapshot = SnapshotOutcome {
        exit_code: 1,
        reason: "Error".to_string(),
        message: "push denied".to_string(),
        running_polls: 2,
    };
    let env = TestEnv::with_cluster(cluster, temp_dir);
    let handle = bar(&env).await;

    let err = expect_err(handle.store().await);
    match err {
        Error::Snapshot { reason, message } => {
            assert_eq!(reason, "Error");
            assert_eq!(message, "push denied");
        }
        other => panic!("unexpected error: {other}"),
    }
    // The instance keeps serving
    assert_eq!(echo(&handle).await, "x -- hello! a: baz b: 1");
}

#[tokio::test]
async fn test_locked_instance_cannot_be_stored_by_others() {
    let env = TestEnv::new();
    let owner = bar(&env).await;
    let other = env
        .client_with(env.source(), CLIENT_B)
        .connect(&owner.process_uri())
        .await
        .unwrap();

    owner.lock(None, None).await.unwrap();
    let err = expect_err(other.store().await);
    assert!(matches!(err, Error::Locked(_)), "{err}");
    assert!(env.cluster.execs().await.is_empty());
}
