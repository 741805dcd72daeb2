//! Custom Resource Definitions for the operation cache
//!
//! Four namespaced kinds share the `controller.azure.github.com/v1alpha1`
//! group: AppDeployment, Operation, Cache, and Requirement.

mod app_deployment;
mod cache;
mod operation;
mod requirement;
mod types;

pub use app_deployment::{AppDeployment, AppDeploymentPhase, AppDeploymentSpec, AppDeploymentStatus};
pub use cache::{Cache, CacheSpec, CacheStatus};
pub use operation::{ApplicationSpec, Operation, OperationPhase, OperationSpec, OperationStatus};
pub use requirement::{
    condition_reasons, condition_types, Requirement, RequirementPhase, RequirementSpec,
    RequirementStatus,
};
pub use types::{Condition, ConditionStatus};

/// API group of every kind in this crate
pub const API_GROUP: &str = "controller.azure.github.com";

/// API version of every kind in this crate
pub const API_VERSION: &str = "v1alpha1";

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

/// Schema for an embedded `batch/v1` JobSpec.
///
/// The job payload is user-defined and validated by the controller, so the
/// CRD stores it verbatim instead of inlining the full upstream schema.
pub(crate) fn job_spec_schema(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Serde helper for skipping empty strings in status blocks
pub(crate) fn is_empty(s: &str) -> bool {
    s.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn every_kind_is_namespaced_in_the_same_group() {
        for crd in [
            AppDeployment::crd(),
            Operation::crd(),
            Cache::crd(),
            Requirement::crd(),
        ] {
            assert_eq!(crd.spec.group, API_GROUP);
            assert_eq!(crd.spec.scope, "Namespaced");
            assert_eq!(crd.spec.versions[0].name, API_VERSION);
            assert!(crd.spec.versions[0].subresources.is_some());
        }
    }

    #[test]
    fn job_templates_preserve_unknown_fields() {
        let crd = serde_json::to_value(AppDeployment::crd()).expect("crd serializes");
        let provision = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"]["provision"];
        assert_eq!(provision["type"], "object");
        assert_eq!(provision["x-kubernetes-preserve-unknown-fields"], true);
    }

    #[test]
    fn crd_names_use_plural_and_group() {
        assert_eq!(
            AppDeployment::crd_name(),
            "appdeployments.controller.azure.github.com"
        );
        assert_eq!(Operation::crd_name(), "operations.controller.azure.github.com");
        assert_eq!(Cache::crd_name(), "caches.controller.azure.github.com");
        assert_eq!(
            Requirement::crd_name(),
            "requirements.controller.azure.github.com"
        );
    }
}
