//! Operation controller
//!
//! Materializes one AppDeployment per application of an Operation, keeps
//! them in sync with the spec, and reports Reconciled once all are Ready.

mod controller;
pub mod diff;

pub use controller::{
    error_policy, new_operation_id, reconcile, OperationContext, OperationKubeClient,
    OperationKubeClientImpl, CONTROLLER_NAME,
};
