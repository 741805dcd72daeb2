//! Requirement CRD types
//!
//! A Requirement is the tenant-facing request for a ready Operation. It is
//! satisfied either by acquiring a warm Operation from the matching Cache or
//! by creating a dedicated Operation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::operation::OperationSpec;
use super::types::Condition;

/// Requirement asks for a Reconciled Operation built from `template`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controller.azure.github.com",
    version = "v1alpha1",
    kind = "Requirement",
    plural = "requirements",
    shortname = "req",
    namespaced,
    status = "RequirementStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Operation","type":"string","jsonPath":".status.operationName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RequirementSpec {
    /// Operation the tenant wants
    pub template: OperationSpec,

    /// Try the warm pool before creating a dedicated Operation
    #[serde(default)]
    pub enable_cache: bool,

    /// Expiry time (RFC 3339, UTC, `Z` suffix); the Requirement deletes itself after it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z$"))]
    pub expire_at: Option<String>,
}

/// Status of a Requirement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementStatus {
    /// Current phase
    #[serde(default)]
    pub phase: RequirementPhase,

    /// Fingerprint of `spec.template.applications`
    #[serde(default, skip_serializing_if = "super::is_empty")]
    pub cache_key: String,

    /// Operation currently bound to this Requirement
    #[serde(default)]
    pub operation_name: String,

    /// `operationId` of the bound Operation once it is Reconciled
    #[serde(default, skip_serializing_if = "super::is_empty")]
    pub operation_id: String,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Phase of a Requirement
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RequirementPhase {
    /// Not yet initialized
    #[default]
    Empty,
    /// Looking for a warm Operation
    CacheChecking,
    /// Waiting for a dedicated (or drifted) Operation to reconcile
    Operating,
    /// Bound to a Reconciled Operation
    Ready,
    /// Deletion requested
    Deleting,
    /// Ready for finalizer removal
    Deleted,
}

impl std::fmt::Display for RequirementPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::CacheChecking => write!(f, "CacheChecking"),
            Self::Operating => write!(f, "Operating"),
            Self::Ready => write!(f, "Ready"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Condition types recorded on a Requirement
pub mod condition_types {
    /// The Requirement has a cache key and an initial phase
    pub const REQUIREMENT_INITIALIZED: &str = "RequirementInitialized";
    /// The Cache for this fingerprint exists
    pub const CACHE_CR_FOUND: &str = "CacheCRFound";
    /// A warm Operation was acquired from the Cache
    pub const CACHED_OP_ACQUIRED: &str = "CachedOpAcquired";
    /// The bound Operation is Reconciled
    pub const OPERATION_READY: &str = "OperationReady";
}

/// Condition reasons recorded on a Requirement
pub mod condition_reasons {
    /// Served from the warm pool
    pub const CACHE_HIT: &str = "CacheHit";
    /// Served by a dedicated Operation
    pub const CACHE_MISS: &str = "CacheMiss";
    /// Cache object exists
    pub const CACHE_CR_FOUND: &str = "CacheCRFound";
    /// Cache object had to be created
    pub const CACHE_CR_NOT_FOUND: &str = "CacheCRNotFound";
    /// Cache exists but has no Reconciled Operation to hand out
    pub const NO_OPERATION_AVAILABLE: &str = "NoOperationAvailable";
    /// Cache key and starting phase recorded
    pub const INITIALIZED: &str = "Initialized";
}
