//! Operation CRD types
//!
//! An Operation is a set of interdependent applications provisioned together.
//! It is created either by a Cache (as a warm pool member) or by a Requirement
//! (on a cache miss), and owns one AppDeployment per application.

use k8s_openapi::api::batch::v1::JobSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// One provisionable unit inside an Operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Application name, unique within the Operation
    pub name: String,

    /// Job that brings the application up
    #[schemars(schema_with = "super::job_spec_schema")]
    pub provision: JobSpec,

    /// Job that tears the application down when its AppDeployment is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::job_spec_schema")]
    pub teardown: Option<JobSpec>,

    /// Names of sibling applications that must be Ready first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Operation is a group of applications sharing one `operationId`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controller.azure.github.com",
    version = "v1alpha1",
    kind = "Operation",
    plural = "operations",
    shortname = "op",
    namespaced,
    status = "OperationStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"OperationId","type":"string","jsonPath":".status.operationId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    /// Applications to provision, in declaration order
    #[serde(default)]
    pub applications: Vec<ApplicationSpec>,

    /// Expiry time (RFC 3339, UTC, `Z` suffix); the Operation deletes itself after it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z$"))]
    pub expire_at: Option<String>,
}

/// Status of an Operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: OperationPhase,

    /// Random 128-bit hex id, assigned once when the Operation leaves Empty
    #[serde(default, skip_serializing_if = "super::is_empty")]
    pub operation_id: String,

    /// Fingerprint of the applications currently applied
    #[serde(default, skip_serializing_if = "super::is_empty")]
    pub cache_key: String,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Phase of an Operation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationPhase {
    /// Not yet reconciled
    #[default]
    Empty,
    /// AppDeployments are being created or updated
    Reconciling,
    /// Every owned AppDeployment is Ready
    Reconciled,
    /// Deletion requested
    Deleting,
    /// Ready for finalizer removal
    Deleted,
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Reconciled => write!(f, "Reconciled"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

impl Operation {
    /// Current phase, `Empty` when no status has been written yet
    pub fn phase(&self) -> OperationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// True once every owned AppDeployment is Ready
    pub fn is_reconciled(&self) -> bool {
        self.phase() == OperationPhase::Reconciled
    }
}
