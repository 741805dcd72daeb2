//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster and installing CRDs.

use std::process::Command;
use std::sync::OnceLock;

use kube::{Client, Config};
use tokio::sync::OnceCell;

use opcache_operator::startup::ensure_crds_installed;

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "opcache-integration-test";

/// Namespace every story runs in
pub const TEST_NAMESPACE: &str = "default";

static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

static CRDS_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

fn kind_cluster_exists(name: &str) -> bool {
    let Ok(output) = Command::new("kind").args(["get", "clusters"]).output() else {
        return false;
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.trim() == name)
}

/// Create a kind cluster for testing, reusing one that already exists
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

async fn create_test_client() -> Result<Client, String> {
    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(format!("kind-{TEST_CLUSTER_NAME}")),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is up with the CRDs applied.
///
/// Returns a fresh Client for each call.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    CLUSTER_INIT
        .get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME))
        .clone()?;

    let client = create_test_client().await?;

    CRDS_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            ensure_crds_installed(&client)
                .await
                .map_err(|e| format!("failed to install CRDs: {e}"))?;
            // Give the API server a moment to establish the new kinds
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            Ok(())
        })
        .await
        .clone()?;

    Ok(client)
}
