//! Requirement controller
//!
//! Resolves a tenant's Requirement to a Reconciled Operation, from the warm
//! pool of the matching Cache when caching is enabled and from a dedicated
//! Operation otherwise.

mod controller;

pub use controller::{
    default_cache_ttl, error_policy, reconcile, RequirementContext, RequirementKubeClient,
    RequirementKubeClientImpl, CONTROLLER_NAME, DEFAULT_RESYNC,
};
