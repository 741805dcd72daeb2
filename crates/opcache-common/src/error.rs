//! Error types for the operation cache controllers
//!
//! Errors carry the resource they were raised for so that controller logs
//! and Kubernetes events point at the object that needs attention.
//! Optimistic-concurrency rejections are split out of [`Error::Kube`] into
//! [`Error::Conflict`] because the controllers requeue them without treating
//! them as failures.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status returned by the API server for stale writes and name clashes
const HTTP_CONFLICT: u16 = 409;

/// HTTP status returned by the API server for missing objects
const HTTP_NOT_FOUND: u16 = 404;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// The API server rejected a write because of a stale resource version
    /// or because the object already exists
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Object the write targeted
        resource: String,
        /// Message returned by the API server
        message: String,
    },

    /// Spec violation (invalid job template, empty cache key, ...)
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the object with the invalid spec
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g. "spec.provision.template.spec.containers")
        field: Option<String>,
    },

    /// Something this object depends on is not Ready yet
    #[error("{resource} waiting on {dependency}: {message}")]
    NotReady {
        /// Object that is waiting
        resource: String,
        /// Object being waited on
        dependency: String,
        /// What is missing
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Several concurrent requests failed
    #[error("{} of a batch of requests failed: {}", .errors.len(), .errors.join("; "))]
    Aggregate {
        /// Rendered message of every failed request
        errors: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "controller")
        context: String,
    },
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == HTTP_CONFLICT => Self::Conflict {
                resource: UNKNOWN_CONTEXT.to_string(),
                message: ae.message.clone(),
            },
            _ => Self::Kube { source },
        }
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a "still waiting" error
    pub fn not_ready(
        resource: impl Into<String>,
        dependency: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::NotReady {
            resource: resource.into(),
            dependency: dependency.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Fold the errors of a concurrent batch into one.
    ///
    /// Returns `None` for an empty batch; a single error is returned as is.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate {
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    /// Attach the name of the object a conflict was raised for
    pub fn on_resource(self, name: impl Into<String>) -> Self {
        match self {
            Self::Conflict { message, .. } => Self::Conflict {
                resource: name.into(),
                message,
            },
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors need a spec edit before a retry can succeed.
    /// Kubernetes errors are retryable unless the server rejected the request
    /// outright with a 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::NotReady { .. } => true,
            Error::Serialization { .. } => false,
            Error::Aggregate { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// True for an optimistic-concurrency or already-exists rejection
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True when the error only signals that a dependency is not Ready yet
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady { .. })
    }
}

/// True when the kube error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == HTTP_NOT_FOUND)
}
