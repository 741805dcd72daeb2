//! AppDeployment controller
//!
//! Drives one application through its provision Job, and through its
//! teardown Job when the AppDeployment is deleted. Provisioning waits until
//! every sibling dependency within the same Operation is Ready.

mod controller;
pub mod job;

pub use controller::{
    error_policy, reconcile, AppDeploymentContext, AppDeploymentKubeClient,
    AppDeploymentKubeClientImpl, CONTROLLER_NAME,
};
