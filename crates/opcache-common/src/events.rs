//! Kubernetes Event recording for the operation cache controllers.
//!
//! Events are fire-and-forget: a failed publish is logged as a warning and
//! never breaks reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - machine-readable reason, see [`reasons`]
    /// * `action` - what the controller was doing, see [`actions`]
    /// * `note` - optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    // AppDeployment
    /// A job template failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A dependency AppDeployment is missing or not Ready
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    /// A provision Job was created
    pub const PROVISION_JOB_CREATED: &str = "ProvisionJobCreated";
    /// The provision Job completed
    pub const PROVISION_SUCCEEDED: &str = "ProvisionSucceeded";
    /// The provision Job failed and will be recreated
    pub const PROVISION_FAILED: &str = "ProvisionFailed";
    /// The teardown Job completed
    pub const TEARDOWN_SUCCEEDED: &str = "TeardownSucceeded";
    /// The teardown Job failed; deletion proceeds anyway
    pub const TEARDOWN_FAILED: &str = "TeardownFailed";

    // Operation
    /// Every AppDeployment of the Operation is Ready
    pub const OPERATION_RECONCILED: &str = "OperationReconciled";
    /// The application set changed after the Operation was Reconciled
    pub const SPEC_DRIFT: &str = "SpecDrift";
    /// The object passed its expiry and is being deleted
    pub const EXPIRED: &str = "Expired";

    // Cache
    /// Warm Operations were created or deleted
    pub const WARM_POOL_SCALED: &str = "WarmPoolScaled";

    // Requirement
    /// A warm Operation satisfied the Requirement
    pub const CACHE_HIT: &str = "CacheHit";
    /// No warm Operation could be used
    pub const CACHE_MISS: &str = "CacheMiss";
    /// A Cache was created for a new cache key
    pub const CACHE_CREATED: &str = "CacheCreated";
    /// A warm Operation was adopted
    pub const OPERATION_ACQUIRED: &str = "OperationAcquired";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Running a provision Job
    pub const PROVISION: &str = "Provision";
    /// Running a teardown Job
    pub const TEARDOWN: &str = "Teardown";
    /// Deleting an object
    pub const DELETE: &str = "Delete";
    /// Resizing a warm pool
    pub const SCALE: &str = "Scale";
    /// Adopting a warm Operation
    pub const ACQUIRE: &str = "Acquire";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reasons_are_pascal_case() {
        assert_eq!(reasons::CACHE_HIT, "CacheHit");
        assert_eq!(reasons::DEPENDENCY_NOT_READY, "DependencyNotReady");
        assert_eq!(actions::ACQUIRE, "Acquire");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::TEARDOWN_FAILED,
                actions::TEARDOWN,
                Some("teardown job failed".to_string()),
            )
            .await;
    }
}
