//! Reconcile step outcomes
//!
//! Every controller runs an ordered list of named steps. A step either lets
//! the pipeline continue, asks for a requeue after a delay, or cancels the
//! rest of this pass. Returning `Err` is "requeue with error": the
//! controller's error policy logs it and requeues after [`ERROR_REQUEUE`].

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::Error;

/// Delay for plain requeues (job still running, object just created, ...)
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(10);

/// Delay applied by every error policy
pub const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// Outcome of one reconcile step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Run the next step
    Continue,
    /// Stop and reconcile again after the delay
    Requeue(Duration),
    /// Stop; a watch event (or the idle resync) brings the object back
    Cancel,
}

/// Result of one reconcile step
pub type StepResult = Result<Step, Error>;

impl Step {
    /// Requeue after [`DEFAULT_REQUEUE`]
    pub fn requeue() -> Self {
        Self::Requeue(DEFAULT_REQUEUE)
    }

    /// Map the final outcome of a pipeline to a controller action.
    ///
    /// `idle` is what a controller does once there is nothing left to do:
    /// wait for a change, or resync periodically.
    pub fn into_action(self, idle: Action) -> Action {
        match self {
            Self::Requeue(delay) => Action::requeue(delay),
            Self::Continue | Self::Cancel => idle,
        }
    }
}

/// Turn an optimistic-concurrency conflict into a plain requeue.
///
/// The next pass re-reads current state, so a stale write is not a failure.
pub fn requeue_on_conflict(result: StepResult) -> StepResult {
    match result {
        Err(e) if e.is_conflict() => {
            tracing::debug!(error = %e, "write conflicted, requeueing");
            Ok(Step::requeue())
        }
        other => other,
    }
}

/// Combine a pipeline outcome with the status write that follows it.
///
/// A pipeline error wins over a failed write; the write error is only logged.
pub fn settle(outcome: StepResult, persisted: Result<(), Error>) -> StepResult {
    match (outcome, persisted) {
        (Err(e), Err(write)) => {
            tracing::warn!(error = %write, "failed to persist status after step error");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(write)) => requeue_on_conflict(Err(write)),
        (Ok(step), Ok(())) => Ok(step),
    }
}

/// Shared body of every controller's error policy.
///
/// Dependency waits are routine and log at debug; spec violations need a
/// tenant edit and log at warn. Every error requeues after [`ERROR_REQUEUE`].
pub fn error_action(controller: &str, name: &str, error: &Error) -> Action {
    if error.is_not_ready() {
        tracing::debug!(controller, object = %name, error = %error, "waiting on dependency");
    } else if matches!(error, Error::Validation { .. }) {
        tracing::warn!(controller, object = %name, error = %error, "spec rejected");
    } else {
        tracing::error!(
            controller,
            object = %name,
            error = %error,
            retryable = error.is_retryable(),
            "reconciliation failed"
        );
    }
    Action::requeue(ERROR_REQUEUE)
}
