//! AppDeployment reconciliation
//!
//! Pipeline, in order:
//! `Validate → EnsureFinalizer → EnsureFinalizerCleared →
//! EnsureDependenciesReady → EnsureProvisionFinished → EnsureTeardownFinished`.
//!
//! Phases: Empty → Pending → Deploying → Ready, and Deleting → Deleted once
//! the deletion timestamp is set. The finalizer is only released in Deleted,
//! after the teardown Job has run.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use opcache_common::crd::{AppDeployment, AppDeploymentPhase, AppDeploymentStatus};
use opcache_common::events::{actions, reasons, EventPublisher};
use opcache_common::kube_utils::{self, has_finalizer, is_deleting};
use opcache_common::metrics::ReconcileTimer;
use opcache_common::pipeline::{error_action, requeue_on_conflict, settle};
use opcache_common::validation::validate_app_deployment;
use opcache_common::{naming, Error, KubeEventPublisher, Step, StepResult, APP_DEPLOYMENT_FINALIZER};
#[cfg(test)]
use opcache_common::NoopEventPublisher;

use crate::job::{build_job, job_state, JobKind, JobState};

/// Controller name used for events and metrics
pub const CONTROLLER_NAME: &str = "appdeployment-controller";

const METRICS_LABEL: &str = "appdeployment";

/// Kubernetes operations the AppDeployment controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppDeploymentKubeClient: Send + Sync {
    /// Get an AppDeployment, `None` if missing
    async fn get_app_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AppDeployment>, Error>;

    /// Merge-patch the status of an AppDeployment
    async fn patch_app_deployment_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AppDeploymentStatus,
    ) -> Result<(), Error>;

    /// Add the AppDeployment finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the AppDeployment finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a Job, `None` if missing
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error>;

    /// Create a Job in its own namespace
    async fn create_job(&self, job: &Job) -> Result<(), Error>;

    /// Delete a Job and its pods in the background
    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// [`AppDeploymentKubeClient`] backed by the API server
pub struct AppDeploymentKubeClientImpl {
    client: Client,
}

impl AppDeploymentKubeClientImpl {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AppDeploymentKubeClient for AppDeploymentKubeClientImpl {
    async fn get_app_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AppDeployment>, Error> {
        kube_utils::get_opt(&self.client, name, namespace).await
    }

    async fn patch_app_deployment_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AppDeploymentStatus,
    ) -> Result<(), Error> {
        kube_utils::patch_status::<AppDeployment>(&self.client, name, namespace, status).await
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::add_finalizer::<AppDeployment>(
            &self.client,
            name,
            namespace,
            APP_DEPLOYMENT_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::remove_finalizer::<AppDeployment>(
            &self.client,
            name,
            namespace,
            APP_DEPLOYMENT_FINALIZER,
        )
        .await
    }

    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error> {
        kube_utils::get_opt(&self.client, name, namespace).await
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let namespace = job.namespace().unwrap_or_default();
        kube_utils::create(&self.client, &namespace, job).await?;
        Ok(())
    }

    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::delete_background::<Job>(&self.client, name, namespace).await
    }
}

/// Shared state for AppDeployment reconciles
pub struct AppDeploymentContext {
    /// Kubernetes access
    pub kube: Arc<dyn AppDeploymentKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl AppDeploymentContext {
    /// Create a context from its parts
    pub fn new(kube: Arc<dyn AppDeploymentKubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    /// Create a production context from a client
    pub fn from_client(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self {
            kube: Arc::new(AppDeploymentKubeClientImpl::new(client)),
            events,
        }
    }

    /// Create a context with a mock client and no events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn AppDeploymentKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(NoopEventPublisher),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Validate,
    EnsureFinalizer,
    EnsureFinalizerCleared,
    EnsureDependenciesReady,
    EnsureProvisionFinished,
    EnsureTeardownFinished,
}

impl Stage {
    const PIPELINE: [Stage; 6] = [
        Stage::Validate,
        Stage::EnsureFinalizer,
        Stage::EnsureFinalizerCleared,
        Stage::EnsureDependenciesReady,
        Stage::EnsureProvisionFinished,
        Stage::EnsureTeardownFinished,
    ];

    fn name(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::EnsureFinalizer => "ensureFinalizer",
            Stage::EnsureFinalizerCleared => "ensureFinalizerCleared",
            Stage::EnsureDependenciesReady => "ensureDependenciesReady",
            Stage::EnsureProvisionFinished => "ensureProvisionFinished",
            Stage::EnsureTeardownFinished => "ensureTeardownFinished",
        }
    }
}

/// Reconcile an AppDeployment
#[instrument(skip(app, ctx), fields(app_deployment = %app.name_any(), namespace = %app.namespace().unwrap_or_default()))]
pub async fn reconcile(
    app: Arc<AppDeployment>,
    ctx: Arc<AppDeploymentContext>,
) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(METRICS_LABEL);
    let result = reconcile_inner(&app, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

async fn reconcile_inner(app: &AppDeployment, ctx: &AppDeploymentContext) -> Result<Action, Error> {
    let name = app.name_any();
    let namespace = app
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "AppDeployment must be namespaced"))?;

    let mut pass = Pass {
        app,
        ctx,
        name,
        namespace,
        status: app.status.clone().unwrap_or_default(),
    };
    debug!(phase = %pass.status.phase, "reconciling");

    let outcome = pass.run().await;
    let persisted = pass.persist().await;
    settle(outcome, persisted).map(|step| step.into_action(Action::await_change()))
}

/// Error policy: log by error kind and requeue after the fixed delay
pub fn error_policy(
    app: Arc<AppDeployment>,
    error: &Error,
    _ctx: Arc<AppDeploymentContext>,
) -> Action {
    error_action(CONTROLLER_NAME, &app.name_any(), error)
}

/// One reconcile pass over a working copy of the status
struct Pass<'a> {
    app: &'a AppDeployment,
    ctx: &'a AppDeploymentContext,
    name: String,
    namespace: String,
    status: AppDeploymentStatus,
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
            Stage::Validate => self.validate().await,
            Stage::EnsureFinalizer => self.ensure_finalizer().await,
            Stage::EnsureFinalizerCleared => self.ensure_finalizer_cleared().await,
            Stage::EnsureDependenciesReady => self.ensure_dependencies_ready().await,
            Stage::EnsureProvisionFinished => self.ensure_provision_finished().await,
            Stage::EnsureTeardownFinished => self.ensure_teardown_finished().await,
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        if self.app.status.clone().unwrap_or_default() == self.status {
            return Ok(());
        }
        self.ctx
            .kube
            .patch_app_deployment_status(&self.name, &self.namespace, &self.status)
            .await
    }

    fn set_phase(&mut self, phase: AppDeploymentPhase) {
        if self.status.phase != phase {
            info!(from = %self.status.phase, to = %phase, "phase transition");
            self.status.phase = phase;
        }
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.app.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    async fn validate(&mut self) -> StepResult {
        if is_deleting(self.app.meta()) {
            return Ok(Step::Continue);
        }
        if let Err(e) = validate_app_deployment(&self.name, &self.app.spec) {
            self.publish(
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                e.to_string(),
            )
            .await;
            return Err(e);
        }
        if self.status.phase == AppDeploymentPhase::Empty {
            self.set_phase(AppDeploymentPhase::Pending);
            self.status.conditions.clear();
        }
        Ok(Step::Continue)
    }

    async fn ensure_finalizer(&mut self) -> StepResult {
        if !is_deleting(self.app.meta()) {
            if !has_finalizer(self.app.meta(), APP_DEPLOYMENT_FINALIZER) {
                self.ctx.kube.add_finalizer(&self.name, &self.namespace).await?;
            }
            return Ok(Step::Continue);
        }
        if !matches!(
            self.status.phase,
            AppDeploymentPhase::Deleting | AppDeploymentPhase::Deleted
        ) {
            self.set_phase(AppDeploymentPhase::Deleting);
        }
        Ok(Step::Continue)
    }

    async fn ensure_finalizer_cleared(&mut self) -> StepResult {
        if is_deleting(self.app.meta()) && self.status.phase == AppDeploymentPhase::Deleted {
            self.ctx.kube.remove_finalizer(&self.name, &self.namespace).await?;
            info!("teardown finished, finalizer released");
            return Ok(Step::Cancel);
        }
        Ok(Step::Continue)
    }

    async fn ensure_dependencies_ready(&mut self) -> StepResult {
        if self.status.phase != AppDeploymentPhase::Pending {
            return Ok(Step::Continue);
        }
        let app = self.app;
        for dep in &app.spec.dependencies {
            let dep_name = naming::app_deployment_name(&app.spec.op_id, dep);
            let dependency = self
                .ctx
                .kube
                .get_app_deployment(&dep_name, &self.namespace)
                .await?;
            let message = match dependency {
                None => "dependency does not exist",
                Some(d) if !d.is_ready() => "dependency is not Ready",
                Some(_) => continue,
            };
            self.publish(
                EventType::Normal,
                reasons::DEPENDENCY_NOT_READY,
                actions::RECONCILE,
                format!("{dep_name}: {message}"),
            )
            .await;
            return Err(Error::not_ready(&self.name, dep_name, message));
        }
        self.set_phase(AppDeploymentPhase::Deploying);
        Ok(Step::Continue)
    }

    async fn ensure_provision_finished(&mut self) -> StepResult {
        if self.status.phase != AppDeploymentPhase::Deploying {
            return Ok(Step::Continue);
        }
        let job_name = JobKind::Provision.job_name(&self.name);
        let Some(job) = self.ctx.kube.get_job(&job_name, &self.namespace).await? else {
            self.create_job(JobKind::Provision, &self.app.spec.provision)
                .await?;
            return Ok(Step::requeue());
        };

        match job_state(&job) {
            JobState::Running => {
                debug!(job = %job_name, "provision job running");
                Ok(Step::requeue())
            }
            JobState::Succeeded => {
                self.ctx.kube.delete_job(&job_name, &self.namespace).await?;
                self.set_phase(AppDeploymentPhase::Ready);
                self.publish(
                    EventType::Normal,
                    reasons::PROVISION_SUCCEEDED,
                    actions::PROVISION,
                    format!("provision job {job_name} succeeded"),
                )
                .await;
                Ok(Step::Continue)
            }
            JobState::Failed => {
                warn!(job = %job_name, "provision job failed, recreating");
                self.publish(
                    EventType::Warning,
                    reasons::PROVISION_FAILED,
                    actions::PROVISION,
                    format!("provision job {job_name} failed, recreating"),
                )
                .await;
                self.ctx.kube.delete_job(&job_name, &self.namespace).await?;
                self.create_job(JobKind::Provision, &self.app.spec.provision)
                    .await?;
                Ok(Step::requeue())
            }
        }
    }

    async fn ensure_teardown_finished(&mut self) -> StepResult {
        if self.status.phase != AppDeploymentPhase::Deleting {
            return Ok(Step::Continue);
        }
        let app = self.app;
        let Some(teardown) = app.spec.teardown.as_ref() else {
            debug!("no teardown job");
            self.set_phase(AppDeploymentPhase::Deleted);
            return Ok(Step::requeue());
        };

        let job_name = JobKind::Teardown.job_name(&self.name);
        let Some(job) = self.ctx.kube.get_job(&job_name, &self.namespace).await? else {
            self.create_job(JobKind::Teardown, teardown).await?;
            return Ok(Step::requeue());
        };

        match job_state(&job) {
            JobState::Running => {
                debug!(job = %job_name, "teardown job running");
                Ok(Step::requeue())
            }
            JobState::Succeeded => {
                self.ctx.kube.delete_job(&job_name, &self.namespace).await?;
                self.publish(
                    EventType::Normal,
                    reasons::TEARDOWN_SUCCEEDED,
                    actions::TEARDOWN,
                    format!("teardown job {job_name} succeeded"),
                )
                .await;
                self.set_phase(AppDeploymentPhase::Deleted);
                Ok(Step::requeue())
            }
            JobState::Failed => {
                self.ctx.kube.delete_job(&job_name, &self.namespace).await?;
                warn!(job = %job_name, "teardown job failed, releasing anyway");
                self.publish(
                    EventType::Warning,
                    reasons::TEARDOWN_FAILED,
                    actions::TEARDOWN,
                    format!("teardown job {job_name} failed; deletion proceeds"),
                )
                .await;
                self.set_phase(AppDeploymentPhase::Deleted);
                Ok(Step::requeue())
            }
        }
    }

    async fn create_job(&self, kind: JobKind, template: &JobSpec) -> Result<(), Error> {
        let job = build_job(self.app, kind, template)?;
        let job_name = job.name_any();
        self.ctx.kube.create_job(&job).await?;
        info!(job = %job_name, %kind, "job created");
        if kind == JobKind::Provision {
            self.publish(
                EventType::Normal,
                reasons::PROVISION_JOB_CREATED,
                actions::PROVISION,
                format!("created provision job {job_name}"),
            )
            .await;
        }
        Ok(())
    }
}
