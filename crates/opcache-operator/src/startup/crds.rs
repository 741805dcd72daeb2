//! CRD installation
//!
//! The operator installs its own CRDs on startup with server-side apply, so
//! the stored schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use opcache_common::crd::{AppDeployment, Cache, Operation, Requirement};
use opcache_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn all_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "appdeployments.controller.azure.github.com",
            crd: AppDeployment::crd(),
        },
        CrdDef {
            name: "operations.controller.azure.github.com",
            crd: Operation::crd(),
        },
        CrdDef {
            name: "caches.controller.azure.github.com",
            crd: Cache::crd(),
        },
        CrdDef {
            name: "requirements.controller.azure.github.com",
            crd: Requirement::crd(),
        },
    ]
}

/// All CRDs as one multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for def in all_crds() {
        let yaml = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        docs.push(yaml);
    }
    Ok(docs.join("---\n"))
}

/// Install or update every CRD
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in all_crds() {
        tracing::info!(crd = def.name, "installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}
