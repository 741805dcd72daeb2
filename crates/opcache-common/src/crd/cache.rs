//! Cache CRD types
//!
//! A Cache keeps a warm pool of Reconciled Operations built from one
//! Operation template. Caches are created lazily by Requirements, one per
//! (namespace, cache key).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::operation::OperationSpec;

/// Cache is a warm pool of Operations sharing a fingerprint.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controller.azure.github.com",
    version = "v1alpha1",
    kind = "Cache",
    plural = "caches",
    shortname = "cache",
    namespaced,
    status = "CacheStatus",
    printcolumn = r#"{"name":"KeepAlive","type":"integer","jsonPath":".status.keepAliveCount"}"#,
    printcolumn = r#"{"name":"ExpireTime","type":"string","jsonPath":".spec.expireTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    /// Template every warm Operation is created from
    pub operation_template: OperationSpec,

    /// Expiry time (RFC 3339, UTC, `Z` suffix); the Cache deletes itself after it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z$"))]
    pub expire_time: Option<String>,

    /// Keep-alive strategy name, reserved for demand-based pool sizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// Status of a Cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Fingerprint of `spec.operationTemplate.applications`
    #[serde(default, skip_serializing_if = "super::is_empty")]
    pub cache_key: String,

    /// Target pool size
    #[serde(default)]
    pub keep_alive_count: i32,

    /// Names of owned Operations currently Reconciled
    #[serde(default)]
    pub available_caches: Vec<String>,
}

impl Cache {
    /// Names of Reconciled pool members as last recorded by the Cache controller
    pub fn available_caches(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.available_caches.as_slice())
            .unwrap_or_default()
    }
}
