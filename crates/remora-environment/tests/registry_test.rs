// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry tag listing against a wiremock registry.

mod common;

use common::*;
use remora_environment::Error;
use remora_environment::image::RegistryClient;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn registry_with_tags(tags: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/remora/tags/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "remora",
            "tags": tags,
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_versions_lists_tags_of_the_type() {
    let server = registry_with_tags(json!(["bar-abc", "foo-def", "bar-abc-1700000000"])).await;
    let env = TestEnv::new();
    let client = env
        .client()
        .with_registry(RegistryClient::with_base_url(server.uri()));

    let versions = client.versions(&bar_descriptor()).await.unwrap();
    assert_eq!(
        versions,
        vec![
            format!("{IMAGE_REPO}:bar-abc"),
            format!("{IMAGE_REPO}:bar-abc-1700000000"),
        ]
    );
}

#[tokio::test]
async fn test_registry_url_derived_from_local_host() {
    let server = registry_with_tags(json!(["bar-1", "bar-2"])).await;
    let repo = format!("{}/remora", server.address());

    let tags = RegistryClient::new().tags(&repo).await.unwrap();
    assert_eq!(tags, vec!["bar-1", "bar-2"]);

    let versions = RegistryClient::new().versions(&repo, "bar").await.unwrap();
    assert_eq!(versions, vec![format!("{repo}:bar-1"), format!("{repo}:bar-2")]);
}

#[tokio::test]
async fn test_missing_repository_has_no_versions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/remora/tags/list"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let registry = RegistryClient::with_base_url(server.uri());
    assert!(registry.versions(IMAGE_REPO, "bar").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_null_tag_list_is_empty() {
    let server = registry_with_tags(serde_json::Value::Null).await;
    let registry = RegistryClient::with_base_url(server.uri());
    assert!(registry.tags(IMAGE_REPO).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registry_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/remora/tags/list"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let registry = RegistryClient::with_base_url(server.uri());
    let err = registry.tags(IMAGE_REPO).await.unwrap_err();
    match err {
        Error::Remote { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "unauthorized");
        }
        other => panic!("unexpected error: {other}"),
    }
}
