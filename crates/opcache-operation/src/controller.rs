//! Operation reconciliation
//!
//! Pipeline: `EnsureFinalizer → EnsureFinalizerCleared → EnsureNotExpired →
//! EnsureAllAppsReady → EnsureAllAppsDeleted`.
//!
//! An Operation gets its `operationId` when it first leaves Empty, then
//! converges its owned AppDeployments on `spec.applications` and becomes
//! Reconciled once all of them are Ready. A changed fingerprint sends a
//! Reconciled Operation back to Reconciling.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use opcache_common::crd::{AppDeployment, Operation, OperationPhase, OperationStatus};
use opcache_common::events::{actions, reasons, EventPublisher};
use opcache_common::fingerprint::fingerprint;
use opcache_common::kube_utils::{self, has_finalizer, is_deleting};
use opcache_common::metrics::ReconcileTimer;
use opcache_common::pipeline::{error_action, requeue_on_conflict, settle};
use opcache_common::validation::validate_application_names;
use opcache_common::{
    naming, timestamp, Error, KubeEventPublisher, Step, StepResult, OPERATION_FINALIZER,
};
#[cfg(test)]
use opcache_common::NoopEventPublisher;

use crate::diff::{diff, expected_app_deployments};

/// Controller name used for events and metrics
pub const CONTROLLER_NAME: &str = "operation-controller";

const METRICS_LABEL: &str = "operation";

/// Kubernetes operations the Operation controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperationKubeClient: Send + Sync {
    /// Merge-patch the status of an Operation
    async fn patch_operation_status(
        &self,
        name: &str,
        namespace: &str,
        status: &OperationStatus,
    ) -> Result<(), Error>;

    /// Add the Operation finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the Operation finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Delete an Operation
    async fn delete_operation(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// AppDeployments whose controller owner has `owner_uid`
    async fn list_owned_app_deployments(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<AppDeployment>, Error>;

    /// Get an AppDeployment, `None` if missing
    async fn get_app_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AppDeployment>, Error>;

    /// Create an AppDeployment in its own namespace
    async fn create_app_deployment(&self, app: &AppDeployment) -> Result<(), Error>;

    /// Replace an AppDeployment; stale resource versions conflict
    async fn replace_app_deployment(&self, app: &AppDeployment) -> Result<(), Error>;

    /// Delete an AppDeployment in the background
    async fn delete_app_deployment(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// [`OperationKubeClient`] backed by the API server
pub struct OperationKubeClientImpl {
    client: Client,
}

impl OperationKubeClientImpl {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OperationKubeClient for OperationKubeClientImpl {
    async fn patch_operation_status(
        &self,
        name: &str,
        namespace: &str,
        status: &OperationStatus,
    ) -> Result<(), Error> {
        kube_utils::patch_status::<Operation>(&self.client, name, namespace, status).await
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::add_finalizer::<Operation>(&self.client, name, namespace, OPERATION_FINALIZER)
            .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::remove_finalizer::<Operation>(
            &self.client,
            name,
            namespace,
            OPERATION_FINALIZER,
        )
        .await
    }

    async fn delete_operation(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::delete_background::<Operation>(&self.client, name, namespace).await
    }

    async fn list_owned_app_deployments(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<AppDeployment>, Error> {
        kube_utils::list_owned(&self.client, namespace, owner_uid).await
    }

    async fn get_app_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AppDeployment>, Error> {
        kube_utils::get_opt(&self.client, name, namespace).await
    }

    async fn create_app_deployment(&self, app: &AppDeployment) -> Result<(), Error> {
        let namespace = app.namespace().unwrap_or_default();
        kube_utils::create(&self.client, &namespace, app).await?;
        Ok(())
    }

    async fn replace_app_deployment(&self, app: &AppDeployment) -> Result<(), Error> {
        let namespace = app.namespace().unwrap_or_default();
        kube_utils::replace(&self.client, &namespace, app).await?;
        Ok(())
    }

    async fn delete_app_deployment(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::delete_background::<AppDeployment>(&self.client, name, namespace).await
    }
}

/// Shared state for Operation reconciles
pub struct OperationContext {
    /// Kubernetes access
    pub kube: Arc<dyn OperationKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl OperationContext {
    /// Create a context from its parts
    pub fn new(kube: Arc<dyn OperationKubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    /// Create a production context from a client
    pub fn from_client(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self {
            kube: Arc::new(OperationKubeClientImpl::new(client)),
            events,
        }
    }

    /// Create a context with a mock client and no events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn OperationKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(NoopEventPublisher),
        }
    }
}

/// Fresh operation id: 128 random bits as 32 lowercase hex characters
pub fn new_operation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    EnsureFinalizer,
    EnsureFinalizerCleared,
    EnsureNotExpired,
    EnsureAllAppsReady,
    EnsureAllAppsDeleted,
}

impl Stage {
    const PIPELINE: [Stage; 5] = [
        Stage::EnsureFinalizer,
        Stage::EnsureFinalizerCleared,
        Stage::EnsureNotExpired,
        Stage::EnsureAllAppsReady,
        Stage::EnsureAllAppsDeleted,
    ];

    fn name(self) -> &'static str {
        match self {
            Stage::EnsureFinalizer => "ensureFinalizer",
            Stage::EnsureFinalizerCleared => "ensureFinalizerCleared",
            Stage::EnsureNotExpired => "ensureNotExpired",
            Stage::EnsureAllAppsReady => "ensureAllAppsReady",
            Stage::EnsureAllAppsDeleted => "ensureAllAppsDeleted",
        }
    }
}

/// Reconcile an Operation
#[instrument(skip(op, ctx), fields(operation = %op.name_any(), namespace = %op.namespace().unwrap_or_default()))]
pub async fn reconcile(op: Arc<Operation>, ctx: Arc<OperationContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(METRICS_LABEL);
    let result = reconcile_inner(&op, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

async fn reconcile_inner(op: &Operation, ctx: &OperationContext) -> Result<Action, Error> {
    let name = op.name_any();
    let namespace = op
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Operation must be namespaced"))?;

    let mut pass = Pass {
        op,
        ctx,
        name,
        namespace,
        status: op.status.clone().unwrap_or_default(),
    };
    debug!(phase = %pass.status.phase, "reconciling");

    let outcome = pass.run().await;
    let persisted = pass.persist().await;
    settle(outcome, persisted).map(|step| step.into_action(Action::await_change()))
}

/// Error policy: log by error kind and requeue after the fixed delay
pub fn error_policy(op: Arc<Operation>, error: &Error, _ctx: Arc<OperationContext>) -> Action {
    error_action(CONTROLLER_NAME, &op.name_any(), error)
}

struct Pass<'a> {
    op: &'a Operation,
    ctx: &'a OperationContext,
    name: String,
    namespace: String,
    status: OperationStatus,
}

impl Pass<'_> {
    async fn run(&mut self) -> StepResult {
        for stage in Stage::PIPELINE {
            debug!(step = stage.name(), "running step");
            match requeue_on_conflict(self.step(stage).await)? {
                Step::Continue => continue,
                other => return Ok(other),
            }
        }
        Ok(Step::Continue)
    }

    async fn step(&mut self, stage: Stage) -> StepResult {
        match stage {
            Stage::EnsureFinalizer => self.ensure_finalizer().await,
            Stage::EnsureFinalizerCleared => self.ensure_finalizer_cleared().await,
            Stage::EnsureNotExpired => self.ensure_not_expired().await,
            Stage::EnsureAllAppsReady => self.ensure_all_apps_ready().await,
            Stage::EnsureAllAppsDeleted => self.ensure_all_apps_deleted(),
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        if self.op.status.clone().unwrap_or_default() == self.status {
            return Ok(());
        }
        self.ctx
            .kube
            .patch_operation_status(&self.name, &self.namespace, &self.status)
            .await
    }

    fn set_phase(&mut self, phase: OperationPhase) {
        if self.status.phase != phase {
            info!(from = %self.status.phase, to = %phase, "phase transition");
            self.status.phase = phase;
        }
    }

    fn in_deletion(&self) -> bool {
        matches!(
            self.status.phase,
            OperationPhase::Deleting | OperationPhase::Deleted
        )
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.op.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    async fn ensure_finalizer(&mut self) -> StepResult {
        if !is_deleting(self.op.meta()) {
            if !has_finalizer(self.op.meta(), OPERATION_FINALIZER) {
                self.ctx.kube.add_finalizer(&self.name, &self.namespace).await?;
            }
            return Ok(Step::Continue);
        }
        if !self.in_deletion() {
            self.set_phase(OperationPhase::Deleting);
        }
        Ok(Step::Continue)
    }

    async fn ensure_finalizer_cleared(&mut self) -> StepResult {
        if is_deleting(self.op.meta()) && self.status.phase == OperationPhase::Deleted {
            self.ctx.kube.remove_finalizer(&self.name, &self.namespace).await?;
            info!("finalizer released");
            return Ok(Step::Cancel);
        }
        Ok(Step::Continue)
    }

    async fn ensure_not_expired(&mut self) -> StepResult {
        if self.in_deletion() || is_deleting(self.op.meta()) {
            return Ok(Step::Continue);
        }
        let Some(expire_at) = self.op.spec.expire_at.as_deref() else {
            return Ok(Step::Continue);
        };
        match timestamp::is_past(expire_at, Utc::now()) {
            Ok(true) => {
                info!(expire_at, "operation expired, deleting");
                self.publish(
                    EventType::Normal,
                    reasons::EXPIRED,
                    actions::DELETE,
                    format!("expired at {expire_at}"),
                )
                .await;
                self.ctx
                    .kube
                    .delete_operation(&self.name, &self.namespace)
                    .await?;
                Ok(Step::Cancel)
            }
            Ok(false) => Ok(Step::Continue),
            Err(e) => {
                warn!(error = %e, "ignoring unparseable expireAt");
                Ok(Step::Continue)
            }
        }
    }

    async fn ensure_all_apps_ready(&mut self) -> StepResult {
        if matches!(
            self.status.phase,
            OperationPhase::Deleting | OperationPhase::Deleted
        ) {
            return Ok(Step::Continue);
        }
        if let Err(e) = validate_application_names(&self.name, &self.op.spec.applications) {
            self.publish(
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                e.to_string(),
            )
            .await;
            return Err(e);
        }

        let key = fingerprint(&self.op.spec.applications);
        match self.status.phase {
            OperationPhase::Deleting | OperationPhase::Deleted => return Ok(Step::Continue),
            OperationPhase::Empty => {
                if self.status.operation_id.is_empty() {
                    self.status.operation_id = new_operation_id();
                    info!(operation_id = %self.status.operation_id, "operation id assigned");
                }
                self.status.conditions.clear();
                self.status.cache_key = key;
                self.set_phase(OperationPhase::Reconciling);
            }
            OperationPhase::Reconciled => {
                if key == self.status.cache_key {
                    return Ok(Step::Continue);
                }
                info!(old = %self.status.cache_key, new = %key, "applications changed");
                self.publish(
                    EventType::Normal,
                    reasons::SPEC_DRIFT,
                    actions::RECONCILE,
                    format!("cache key changed to {key}"),
                )
                .await;
                self.status.cache_key = key;
                self.set_phase(OperationPhase::Reconciling);
            }
            OperationPhase::Reconciling => {
                self.status.cache_key = key;
            }
        }

        self.sync_app_deployments().await?;
        self.check_app_deployments_ready().await
    }

    /// Create, delete and update owned AppDeployments to match the spec
    async fn sync_app_deployments(&self) -> Result<(), Error> {
        let uid = self
            .op
            .uid()
            .ok_or_else(|| Error::internal_with_context("operation", "Operation has no uid"))?;
        let expected = expected_app_deployments(self.op, &self.status.operation_id)?;
        let current = self
            .ctx
            .kube
            .list_owned_app_deployments(&self.namespace, &uid)
            .await?;
        let changes = diff(&expected, &current);
        if changes.is_empty() {
            return Ok(());
        }
        info!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            updated = changes.updated.len(),
            "syncing app deployments"
        );

        for app in &changes.added {
            self.ctx.kube.create_app_deployment(app).await?;
        }
        for app in &changes.removed {
            self.ctx
                .kube
                .delete_app_deployment(&app.name_any(), &self.namespace)
                .await?;
        }
        for app in &changes.updated {
            self.ctx.kube.replace_app_deployment(app).await?;
        }
        Ok(())
    }

    async fn check_app_deployments_ready(&mut self) -> StepResult {
        for app in &self.op.spec.applications {
            let name = naming::app_deployment_name(&self.status.operation_id, &app.name);
            let ready = self
                .ctx
                .kube
                .get_app_deployment(&name, &self.namespace)
                .await?
                .is_some_and(|a| a.is_ready());
            if !ready {
                return Err(Error::not_ready(&self.name, name, "AppDeployment is not Ready"));
            }
        }

        self.set_phase(OperationPhase::Reconciled);
        self.publish(
            EventType::Normal,
            reasons::OPERATION_RECONCILED,
            actions::RECONCILE,
            format!("{} applications ready", self.op.spec.applications.len()),
        )
        .await;
        Ok(Step::Cancel)
    }

    fn ensure_all_apps_deleted(&mut self) -> StepResult {
        if self.status.phase != OperationPhase::Deleting {
            return Ok(Step::Continue);
        }
        self.set_phase(OperationPhase::Deleted);
        Ok(Step::requeue())
    }
}
