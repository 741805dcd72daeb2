//! Common types for the operation cache controllers: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod kube_utils;
pub mod metrics;
pub mod naming;
pub mod pipeline;
pub mod telemetry;
pub mod timestamp;
pub mod validation;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use pipeline::{Step, StepResult};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the controllers make
pub const FIELD_MANAGER: &str = "operation-cache-controller";

/// Finalizer guarding AppDeployment teardown
pub const APP_DEPLOYMENT_FINALIZER: &str = "finalizer.appdeployment.devinfra.goms.io";

/// Finalizer guarding Operation removal
pub const OPERATION_FINALIZER: &str = "finalizer.operation.controller.azure.com";

/// Finalizer guarding Requirement removal
pub const REQUIREMENT_FINALIZER: &str = "finalizer.requirement.devinfra.goms.io";

/// Annotation stamped on an Operation when a Requirement acquires it.
/// The value is the acquisition time in RFC 3339.
pub const ACQUIRED_ANNOTATION: &str = "operation.controller.azure.com/acquired";

/// Annotation marking an Operation as a warm pool member
pub const CACHE_MODE_ANNOTATION: &str = "operation-cache-controller.azure.github.com/cache-mode";

/// Label carrying the (truncated) cache key of an Operation
pub const CACHE_KEY_LABEL: &str = "operation-cache-controller.azure.github.com/cache-key";

/// Environment variable injected into every provision/teardown container
pub const OPERATION_ID_ENV: &str = "OPERATION_ID";

/// Label value for `app.kubernetes.io/managed-by` on objects we create
pub const MANAGED_BY: &str = "operation-cache-controller";
