//! Cache controller
//!
//! Keeps a pool of Reconciled warm Operations per cache key. Requirements
//! acquire Operations out of the pool; the controller refills it on the next
//! pass.

mod controller;
pub mod planner;

pub use controller::{
    error_policy, reconcile, CacheContext, CacheKubeClient, CacheKubeClientImpl,
    CONTROLLER_NAME, DEFAULT_KEEP_ALIVE_COUNT, DEFAULT_RESYNC,
};
