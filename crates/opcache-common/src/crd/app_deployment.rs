//! AppDeployment CRD types
//!
//! One application instance inside one Operation. Created by the Operation
//! controller and driven through provision/teardown Jobs by the AppDeployment
//! controller.

use k8s_openapi::api::batch::v1::JobSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// AppDeployment drives one application through its Job lifecycle.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controller.azure.github.com",
    version = "v1alpha1",
    kind = "AppDeployment",
    plural = "appdeployments",
    shortname = "appdep",
    namespaced,
    status = "AppDeploymentStatus",
    printcolumn = r#"{"name":"OperationId","type":"string","jsonPath":".spec.opId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentSpec {
    /// Job that brings the application up
    #[schemars(schema_with = "super::job_spec_schema")]
    pub provision: JobSpec,

    /// Job run before the object is released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::job_spec_schema")]
    pub teardown: Option<JobSpec>,

    /// Id of the owning Operation; injected as `OPERATION_ID`
    pub op_id: String,

    /// Sibling application names (within the same Operation) that must be Ready first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Status of an AppDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentStatus {
    /// Current phase
    #[serde(default)]
    pub phase: AppDeploymentPhase,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Phase of an AppDeployment
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppDeploymentPhase {
    /// Not yet validated
    #[default]
    Empty,
    /// Validated, waiting for dependencies
    Pending,
    /// Provision Job running
    Deploying,
    /// Provision Job succeeded
    Ready,
    /// Teardown Job running
    Deleting,
    /// Teardown finished; finalizer may be removed
    Deleted,
}

impl std::fmt::Display for AppDeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Pending => write!(f, "Pending"),
            Self::Deploying => write!(f, "Deploying"),
            Self::Ready => write!(f, "Ready"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

impl AppDeployment {
    /// Current phase, `Empty` when no status has been written yet
    pub fn phase(&self) -> AppDeploymentPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// True once the provision Job has succeeded
    pub fn is_ready(&self) -> bool {
        self.phase() == AppDeploymentPhase::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_defaults_to_empty() {
        let app = AppDeployment::new("op-web", AppDeploymentSpec::default());
        assert_eq!(app.phase(), AppDeploymentPhase::Empty);
        assert!(!app.is_ready());
    }

    #[test]
    fn phase_display_matches_serialized_form() {
        for phase in [
            AppDeploymentPhase::Empty,
            AppDeploymentPhase::Pending,
            AppDeploymentPhase::Deploying,
            AppDeploymentPhase::Ready,
            AppDeploymentPhase::Deleting,
            AppDeploymentPhase::Deleted,
        ] {
            let json = serde_json::to_value(phase).expect("serializes");
            assert_eq!(json, phase.to_string());
        }
    }

    #[test]
    fn spec_uses_op_id_key() {
        let spec = AppDeploymentSpec {
            op_id: "abc".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).expect("serializes");
        assert_eq!(json["opId"], "abc");
        assert!(json.get("teardown").is_none());
    }
}
