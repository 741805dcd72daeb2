//! Integration tests for CRD operations
//!
//! Each test is a scenario a tenant or platform operator runs into when
//! talking to the API server directly, before any controller acts.

use k8s_openapi::api::batch::v1::JobSpec;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;

use opcache_common::crd::{
    ApplicationSpec, Cache, CacheSpec, Operation, OperationPhase, OperationSpec, OperationStatus,
    Requirement, RequirementPhase, RequirementSpec,
};
use opcache_common::kube_utils::NamespacedResource;

use super::helpers::{ensure_test_cluster, TEST_NAMESPACE};

fn sample_template() -> OperationSpec {
    OperationSpec {
        applications: vec![
            ApplicationSpec {
                name: "database".to_string(),
                provision: JobSpec::default(),
                teardown: None,
                dependencies: vec![],
            },
            ApplicationSpec {
                name: "api".to_string(),
                provision: JobSpec::default(),
                teardown: None,
                dependencies: vec!["database".to_string()],
            },
        ],
        expire_at: None,
    }
}

async fn cleanup<K: NamespacedResource>(client: &Client, name: &str) {
    let api: Api<K> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;
}

/// Story: Tenant asks for an environment through a Requirement
///
/// The tenant submits only the template and the cache opt-in. Everything
/// else is the controller's business.
///
/// Expected behavior:
/// - The Requirement is stored with its applications in order
/// - A fresh Requirement reads back with no status
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_tenant_creates_requirement() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Requirement> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "test-req-create";
    cleanup::<Requirement>(&client, name).await;

    let req = Requirement::new(
        name,
        RequirementSpec {
            template: sample_template(),
            enable_cache: true,
            expire_at: Some("2099-01-01T00:00:00Z".to_string()),
        },
    );
    api.create(&PostParams::default(), &req)
        .await
        .expect("failed to create requirement");

    let fetched = api.get(name).await.expect("failed to get requirement");
    assert!(fetched.spec.enable_cache);
    let apps: Vec<&str> = fetched
        .spec
        .template
        .applications
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(apps, vec!["database", "api"]);
    assert_eq!(
        fetched.status.map(|s| s.phase).unwrap_or_default(),
        RequirementPhase::Empty
    );

    cleanup::<Requirement>(&client, name).await;
}

/// Story: A malformed expiry time never reaches the controller
///
/// Expiry times must be UTC RFC 3339 with a `Z` suffix. The CRD schema
/// pattern rejects anything else at admission.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_api_server_rejects_malformed_cache_expiry() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Cache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "test-cache-bad-expiry";
    cleanup::<Cache>(&client, name).await;

    let cache = Cache::new(
        name,
        CacheSpec {
            operation_template: sample_template(),
            expire_time: Some("tomorrow".to_string()),
            strategy: None,
        },
    );
    let result = api.create(&PostParams::default(), &cache).await;

    match result {
        Err(kube::Error::Api(e)) => assert_eq!(e.code, 422),
        other => panic!("expected a validation error, got {other:?}"),
    }
}

/// Story: Operation status is written through the status subresource
///
/// Controllers only patch `/status`, so a status change must not bump the
/// spec and a spec apply must not wipe the status.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_operation_status_survives_spec_updates() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Operation> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "test-op-status";
    cleanup::<Operation>(&client, name).await;

    api.create(
        &PostParams::default(),
        &Operation::new(name, sample_template()),
    )
    .await
    .expect("failed to create operation");

    let status = serde_json::json!({
        "status": OperationStatus {
            phase: OperationPhase::Reconciled,
            operation_id: "0123456789abcdef0123456789abcdef".to_string(),
            ..Default::default()
        }
    });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
        .await
        .expect("failed to patch status");

    let spec = serde_json::json!({ "spec": { "expireAt": "2099-01-01T00:00:00Z" } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&spec))
        .await
        .expect("failed to patch spec");

    let fetched = api.get(name).await.expect("failed to get operation");
    assert_eq!(fetched.spec.expire_at.as_deref(), Some("2099-01-01T00:00:00Z"));
    let status = fetched.status.expect("status is kept");
    assert_eq!(status.phase, OperationPhase::Reconciled);
    assert_eq!(status.operation_id, "0123456789abcdef0123456789abcdef");

    cleanup::<Operation>(&client, name).await;
}
