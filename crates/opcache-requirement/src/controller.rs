//! Requirement reconciliation
//!
//! Pipeline: `ensureFinalizer → ensureFinalizerCleared → ensureNotExpired →
//! ensureInitialized → ensureCacheExisted → ensureCachedOperationAcquired →
//! ensureOperationReady → ensureDeletionFinished`.
//!
//! With caching enabled a Requirement first looks for the Cache of its
//! fingerprint and tries to acquire one of its warm Operations. Acquisition
//! rewrites the Operation's owner reference with an optimistic write, so two
//! Requirements racing for the same Operation cannot both win. Without a
//! cache hit the Requirement creates and owns `<name>-operation`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use opcache_common::conditions::set_condition;
use opcache_common::crd::{
    condition_reasons, condition_types, Cache, CacheSpec, Condition, ConditionStatus, Operation,
    OperationSpec, Requirement, RequirementPhase, RequirementStatus,
};
use opcache_common::events::{actions, reasons, EventPublisher};
use opcache_common::fingerprint::fingerprint;
use opcache_common::kube_utils::{self, controller_owner_ref, has_finalizer, is_controlled_by, is_deleting};
use opcache_common::metrics::{self, CacheLookup, ReconcileTimer};
use opcache_common::pipeline::{error_action, requeue_on_conflict, settle};
use opcache_common::{
    naming, timestamp, Error, KubeEventPublisher, Step, StepResult, ACQUIRED_ANNOTATION,
    CACHE_KEY_LABEL, MANAGED_BY, REQUIREMENT_FINALIZER,
};
#[cfg(test)]
use opcache_common::NoopEventPublisher;

/// Controller name used for events and metrics
pub const CONTROLLER_NAME: &str = "requirement-controller";

const METRICS_LABEL: &str = "requirement";

/// Requeue interval after a clean pass when none is configured
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(600);

/// Expiry given to Caches a Requirement creates or touches, when none is
/// configured
pub fn default_cache_ttl() -> chrono::Duration {
    chrono::Duration::hours(2)
}

/// Kubernetes operations the Requirement controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequirementKubeClient: Send + Sync {
    /// Merge-patch the status of a Requirement
    async fn patch_requirement_status(
        &self,
        name: &str,
        namespace: &str,
        status: &RequirementStatus,
    ) -> Result<(), Error>;

    /// Add the Requirement finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the Requirement finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Delete a Requirement
    async fn delete_requirement(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a Cache, `None` if missing
    async fn get_cache(&self, name: &str, namespace: &str) -> Result<Option<Cache>, Error>;

    /// Create a Cache in its own namespace
    async fn create_cache(&self, cache: &Cache) -> Result<(), Error>;

    /// Push a Cache's expiry out to `expire_time`
    async fn extend_cache_expiry(
        &self,
        name: &str,
        namespace: &str,
        expire_time: &str,
    ) -> Result<(), Error>;

    /// Get an Operation, `None` if missing
    async fn get_operation(&self, name: &str, namespace: &str) -> Result<Option<Operation>, Error>;

    /// Create an Operation in its own namespace
    async fn create_operation(&self, op: &Operation) -> Result<(), Error>;

    /// Replace an Operation; a stale resource version is a conflict
    async fn replace_operation(&self, op: &Operation) -> Result<(), Error>;

    /// Merge-patch the spec of an Operation
    async fn patch_operation_spec(
        &self,
        name: &str,
        namespace: &str,
        spec: &OperationSpec,
    ) -> Result<(), Error>;
}

/// [`RequirementKubeClient`] backed by the API server
pub struct RequirementKubeClientImpl {
    client: Client,
}

impl RequirementKubeClientImpl {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RequirementKubeClient for RequirementKubeClientImpl {
    async fn patch_requirement_status(
        &self,
        name: &str,
        namespace: &str,
        status: &RequirementStatus,
    ) -> Result<(), Error> {
        kube_utils::patch_status::<Requirement>(&self.client, name, namespace, status).await
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::add_finalizer::<Requirement>(
            &self.client,
            name,
            namespace,
            REQUIREMENT_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::remove_finalizer::<Requirement>(
            &self.client,
            name,
            namespace,
            REQUIREMENT_FINALIZER,
        )
        .await
    }

    async fn delete_requirement(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::delete_background::<Requirement>(&self.client, name, namespace).await
    }

    async fn get_cache(&self, name: &str, namespace: &str) -> Result<Option<Cache>, Error> {
        kube_utils::get_opt(&self.client, name, namespace).await
    }

    async fn create_cache(&self, cache: &Cache) -> Result<(), Error> {
        let namespace = cache.namespace().unwrap_or_default();
        kube_utils::create(&self.client, &namespace, cache).await?;
        Ok(())
    }

    async fn extend_cache_expiry(
        &self,
        name: &str,
        namespace: &str,
        expire_time: &str,
    ) -> Result<(), Error> {
        let spec = serde_json::json!({ "expireTime": expire_time });
        kube_utils::patch_spec::<Cache>(&self.client, name, namespace, &spec).await
    }

    async fn get_operation(&self, name: &str, namespace: &str) -> Result<Option<Operation>, Error> {
        kube_utils::get_opt(&self.client, name, namespace).await
    }

    async fn create_operation(&self, op: &Operation) -> Result<(), Error> {
        let namespace = op.namespace().unwrap_or_default();
        kube_utils::create(&self.client, &namespace, op).await?;
        Ok(())
    }

    async fn replace_operation(&self, op: &Operation) -> Result<(), Error> {
        let namespace = op.namespace().unwrap_or_default();
        kube_utils::replace(&self.client, &namespace, op).await?;
        Ok(())
    }

    async fn patch_operation_spec(
        &self,
        name: &str,
        namespace: &str,
        spec: &OperationSpec,
    ) -> Result<(), Error> {
        kube_utils::patch_spec::<Operation>(&self.client, name, namespace, spec).await
    }
}

/// Shared state for Requirement reconciles
pub struct RequirementContext {
    /// Kubernetes access
    pub kube: Arc<dyn RequirementKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Expiry given to created or extended Caches
    pub cache_ttl: chrono::Duration,
    /// Requeue interval after a clean pass
    pub resync: Duration,
}

impl RequirementContext {
    /// Create a context from its parts
    pub fn new(
        kube: Arc<dyn RequirementKubeClient>,
        events: Arc<dyn EventPublisher>,
        cache_ttl: chrono::Duration,
        resync: Duration,
    ) -> Self {
        Self {
            kube,
            events,
            cache_ttl,
            resync,
        }
    }

    /// Create a production context from a client
    pub fn from_client(client: Client, cache_ttl: chrono::Duration, resync: Duration) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(RequirementKubeClientImpl::new(client)),
            events,
            cache_ttl,
            resync,
        )
    }

    /// Create a context with a mock client, no events and default settings
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn RequirementKubeClient>) -> Self {
        Self::new(
            kube,
            Arc::new(NoopEventPublisher),
            default_cache_ttl(),
            DEFAULT_RESYNC,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    EnsureFinalizer,
    EnsureFinalizerCleared,
    EnsureNotExpired,
    EnsureInitialized,
    EnsureCacheExisted,
    EnsureCachedOperationAcquired,
    EnsureOperationReady,
    EnsureDeletionFinished,
}

impl Stage {
    const PIPELINE: [Stage; 8] = [
        Stage::EnsureFinalizer,
        Stage::EnsureFinalizerCleared,
        Stage::EnsureNotExpired,
        Stage::EnsureInitialized,
        Stage::EnsureCacheExisted,
        Stage::EnsureCachedOperationAcquired,
        Stage::EnsureOperationReady,
        Stage::EnsureDeletionFinished,
    ];

    fn name(self) -> &'static str {
        match self {
            Stage::EnsureFinalizer => "ensureFinalizer",
            Stage::EnsureFinalizerCleared => "ensureFinalizerCleared",
            Stage::EnsureNotExpired => "ensureNotExpired",
            Stage::EnsureInitialized => "ensureInitialized",
            Stage::EnsureCacheExisted => "ensureCacheExisted",
            Stage::EnsureCachedOperationAcquired => "ensureCachedOperationAcquired",
            Stage::EnsureOperationReady => "ensureOperationReady",
            Stage::EnsureDeletionFinished => "ensureDeletionFinished",
        }
    }
}

/// Reconcile a Requirement
#[instrument(skip(req, ctx), fields(requirement = %req.name_any(), namespace = %req.namespace().unwrap_or_default()))]
pub async fn reconcile(req: Arc<Requirement>, ctx: Arc<RequirementContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(METRICS_LABEL);
    let result = reconcile_inner(&req, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

async fn reconcile_inner(req: &Requirement, ctx: &RequirementContext) -> Result<Action, Error> {
    let name = req.name_any();
    let namespace = req
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Requirement must be namespaced"))?;

    let mut pass = Pass {
        req,
        ctx,
        name,
        namespace,
        status: req.status.clone().unwrap_or_default(),
    };
    debug!(phase = %pass.status.phase, "reconciling");

    let outcome = pass.run().await;
    let persisted = pass.persist().await;
    settle(outcome, persisted).map(|step| step.into_action(Action::requeue(ctx.resync)))
}

/// Error policy: log by error kind and requeue after the fixed delay
pub fn error_policy(req: Arc<Requirement>, error: &Error, _ctx: Arc<RequirementContext>) -> Action {
    error_action(CONTROLLER_NAME, &req.name_any(), error)
}

struct Pass<'a> {
    req: &'a Requirement,
    ctx: &'a RequirementContext,
    name: String,
    namespace: String,
    status: RequirementStatus,
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
            Stage::EnsureInitialized => self.ensure_initialized(),
            Stage::EnsureCacheExisted => self.ensure_cache_existed().await,
            Stage::EnsureCachedOperationAcquired => self.ensure_cached_operation_acquired().await,
            Stage::EnsureOperationReady => self.ensure_operation_ready().await,
            Stage::EnsureDeletionFinished => self.ensure_deletion_finished(),
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        if self.req.status.clone().unwrap_or_default() == self.status {
            return Ok(());
        }
        self.ctx
            .kube
            .patch_requirement_status(&self.name, &self.namespace, &self.status)
            .await
    }

    fn set_phase(&mut self, phase: RequirementPhase) {
        if self.status.phase != phase {
            info!(from = %self.status.phase, to = %phase, "phase transition");
            self.status.phase = phase;
        }
    }

    fn mark(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        set_condition(
            &mut self.status.conditions,
            Condition::new(type_, status, reason, message),
        );
    }

    fn in_deletion(&self) -> bool {
        matches!(
            self.status.phase,
            RequirementPhase::Deleting | RequirementPhase::Deleted
        )
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.req.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    async fn ensure_finalizer(&mut self) -> StepResult {
        if !is_deleting(self.req.meta()) {
            if !has_finalizer(self.req.meta(), REQUIREMENT_FINALIZER) {
                self.ctx.kube.add_finalizer(&self.name, &self.namespace).await?;
            }
            return Ok(Step::Continue);
        }
        if !self.in_deletion() {
            self.set_phase(RequirementPhase::Deleting);
        }
        Ok(Step::Continue)
    }

    async fn ensure_finalizer_cleared(&mut self) -> StepResult {
        if is_deleting(self.req.meta()) && self.status.phase == RequirementPhase::Deleted {
            self.ctx.kube.remove_finalizer(&self.name, &self.namespace).await?;
            info!("finalizer released");
            return Ok(Step::Cancel);
        }
        Ok(Step::Continue)
    }

    async fn ensure_not_expired(&mut self) -> StepResult {
        if self.in_deletion() || is_deleting(self.req.meta()) {
            return Ok(Step::Continue);
        }
        let Some(expire_at) = self.req.spec.expire_at.as_deref() else {
            return Ok(Step::Continue);
        };
        match timestamp::is_past(expire_at, Utc::now()) {
            Ok(true) => {
                info!(expire_at, "requirement expired, deleting");
                self.publish(
                    EventType::Normal,
                    reasons::EXPIRED,
                    actions::DELETE,
                    format!("expired at {expire_at}"),
                )
                .await;
                self.ctx
                    .kube
                    .delete_requirement(&self.name, &self.namespace)
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

    fn ensure_initialized(&mut self) -> StepResult {
        if self.status.phase != RequirementPhase::Empty {
            return Ok(Step::Continue);
        }
        self.status.cache_key = fingerprint(&self.req.spec.template.applications);
        self.status.conditions.clear();
        self.mark(
            condition_types::REQUIREMENT_INITIALIZED,
            ConditionStatus::True,
            condition_reasons::INITIALIZED,
            "cache key computed",
        );
        if self.req.spec.enable_cache {
            self.set_phase(RequirementPhase::CacheChecking);
        } else {
            self.set_phase(RequirementPhase::Operating);
        }
        Ok(Step::Continue)
    }

    async fn ensure_cache_existed(&mut self) -> StepResult {
        if self.status.phase != RequirementPhase::CacheChecking
            || !self.status.operation_name.is_empty()
        {
            return Ok(Step::Continue);
        }
        if self.status.cache_key.is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "status.cacheKey",
                "cache key is empty",
            ));
        }

        let cache_name = naming::cache_name(&self.status.cache_key);
        let expire_time = timestamp::from_now(self.ctx.cache_ttl);

        let Some(cache) = self.ctx.kube.get_cache(&cache_name, &self.namespace).await? else {
            self.ctx.kube.create_cache(&self.new_cache(&cache_name, expire_time)).await?;
            info!(cache = %cache_name, "cache created");
            self.publish(
                EventType::Normal,
                reasons::CACHE_CREATED,
                actions::RECONCILE,
                format!("created cache {cache_name}"),
            )
            .await;
            self.mark(
                condition_types::CACHE_CR_FOUND,
                ConditionStatus::False,
                condition_reasons::CACHE_CR_NOT_FOUND,
                &format!("cache {cache_name} did not exist"),
            );
            self.record_miss(
                condition_reasons::CACHE_MISS,
                &format!("cache {cache_name} was just created"),
            )
            .await;
            return Ok(Step::Continue);
        };

        self.mark(
            condition_types::CACHE_CR_FOUND,
            ConditionStatus::True,
            condition_reasons::CACHE_CR_FOUND,
            &format!("cache {cache_name} exists"),
        );
        if let Err(e) = self
            .ctx
            .kube
            .extend_cache_expiry(&cache_name, &self.namespace, &expire_time)
            .await
        {
            warn!(cache = %cache_name, error = %e, "failed to extend cache expiry");
        }

        let candidate = cache
            .available_caches()
            .choose(&mut rand::thread_rng())
            .cloned();
        match candidate {
            Some(op) => {
                debug!(candidate = %op, "picked warm operation");
                self.status.operation_name = op;
            }
            None => debug!(cache = %cache_name, "no warm operation available"),
        }
        Ok(Step::Continue)
    }

    fn new_cache(&self, name: &str, expire_time: String) -> Cache {
        Cache {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: CacheSpec {
                operation_template: self.req.spec.template.clone(),
                expire_time: Some(expire_time),
                strategy: None,
            },
            status: None,
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "app.kubernetes.io/managed-by".to_string(),
                MANAGED_BY.to_string(),
            ),
            (
                CACHE_KEY_LABEL.to_string(),
                naming::cache_key_label_value(&self.status.cache_key),
            ),
        ])
    }

    async fn ensure_cached_operation_acquired(&mut self) -> StepResult {
        if self.status.phase != RequirementPhase::CacheChecking {
            return Ok(Step::Continue);
        }
        if self.status.operation_name.is_empty() {
            self.record_miss(
                condition_reasons::NO_OPERATION_AVAILABLE,
                "no warm operation available",
            )
            .await;
            return Ok(Step::Continue);
        }

        let candidate = self.status.operation_name.clone();
        let Some(op) = self.ctx.kube.get_operation(&candidate, &self.namespace).await? else {
            self.status.operation_name.clear();
            self.record_miss(
                condition_reasons::CACHE_MISS,
                &format!("warm operation {candidate} is gone"),
            )
            .await;
            return Ok(Step::Continue);
        };

        let uid = self.req.uid().unwrap_or_default();
        if op.annotations().contains_key(ACQUIRED_ANNOTATION) {
            if !uid.is_empty() && is_controlled_by(op.meta(), &uid) {
                if is_deleting(op.meta()) {
                    info!(operation = %candidate, "held operation is being deleted");
                    self.status.operation_name.clear();
                    self.record_miss(
                        condition_reasons::CACHE_MISS,
                        &format!("warm operation {candidate} is being deleted"),
                    )
                    .await;
                    return Ok(Step::Continue);
                }
                if !op.is_reconciled() {
                    debug!(operation = %candidate, phase = %op.phase(), "held operation is not reconciled");
                    self.mark(
                        condition_types::OPERATION_READY,
                        ConditionStatus::False,
                        condition_reasons::CACHE_HIT,
                        "waiting for acquired operation",
                    );
                    self.set_phase(RequirementPhase::Operating);
                    return Ok(Step::Continue);
                }
                debug!(operation = %candidate, "operation already acquired by this requirement");
                self.record_hit(&op);
                return Ok(Step::Cancel);
            }
            info!(operation = %candidate, "warm operation taken by another requirement");
            self.status.operation_name.clear();
            self.record_miss(
                condition_reasons::CACHE_MISS,
                &format!("warm operation {candidate} was acquired elsewhere"),
            )
            .await;
            return Ok(Step::Continue);
        }

        if !op.is_reconciled() || is_deleting(op.meta()) {
            info!(operation = %candidate, phase = %op.phase(), "warm operation is no longer available");
            self.status.operation_name.clear();
            self.record_miss(
                condition_reasons::CACHE_MISS,
                &format!("warm operation {candidate} is not available"),
            )
            .await;
            return Ok(Step::Continue);
        }

        let acquired = self.acquire(op)?;
        self.ctx.kube.replace_operation(&acquired).await?;
        info!(operation = %candidate, "warm operation acquired");
        self.publish(
            EventType::Normal,
            reasons::OPERATION_ACQUIRED,
            actions::ACQUIRE,
            format!("acquired warm operation {candidate}"),
        )
        .await;
        self.publish(
            EventType::Normal,
            reasons::CACHE_HIT,
            actions::ACQUIRE,
            format!("cache hit on {}", naming::cache_name(&self.status.cache_key)),
        )
        .await;
        metrics::record_cache_lookup(CacheLookup::Hit);
        self.record_hit(&acquired);
        Ok(Step::Cancel)
    }

    /// Stamp the acquired annotation and make this Requirement the sole
    /// controller owner. The result keeps the resource version it was read
    /// with, so a concurrent acquisition makes the write conflict.
    fn acquire(&self, mut op: Operation) -> Result<Operation, Error> {
        op.annotations_mut()
            .insert(ACQUIRED_ANNOTATION.to_string(), timestamp::now());
        op.metadata.owner_references = Some(vec![controller_owner_ref(self.req)?]);
        Ok(op)
    }

    fn record_hit(&mut self, op: &Operation) {
        if let Some(id) = op.status.as_ref().map(|s| s.operation_id.clone()) {
            if !id.is_empty() {
                self.status.operation_id = id;
            }
        }
        self.mark(
            condition_types::CACHED_OP_ACQUIRED,
            ConditionStatus::True,
            condition_reasons::CACHE_HIT,
            &format!("acquired {}", op.name_any()),
        );
        self.mark(
            condition_types::OPERATION_READY,
            ConditionStatus::True,
            condition_reasons::CACHE_HIT,
            "warm operation is ready",
        );
        self.set_phase(RequirementPhase::Ready);
    }

    async fn record_miss(&mut self, reason: &str, message: &str) {
        self.mark(
            condition_types::CACHED_OP_ACQUIRED,
            ConditionStatus::False,
            reason,
            message,
        );
        metrics::record_cache_lookup(CacheLookup::Miss);
        self.publish(
            EventType::Normal,
            reasons::CACHE_MISS,
            actions::RECONCILE,
            message.to_string(),
        )
        .await;
        self.set_phase(RequirementPhase::Operating);
    }

    async fn ensure_operation_ready(&mut self) -> StepResult {
        let key = fingerprint(&self.req.spec.template.applications);
        match self.status.phase {
            RequirementPhase::Ready => {
                if key == self.status.cache_key {
                    return Ok(Step::Continue);
                }
                self.push_template(key).await?;
                self.mark(
                    condition_types::OPERATION_READY,
                    ConditionStatus::False,
                    condition_reasons::CACHE_MISS,
                    "template changed",
                );
                self.set_phase(RequirementPhase::Operating);
                return Ok(Step::requeue());
            }
            RequirementPhase::Operating => {}
            _ => return Ok(Step::Continue),
        }

        if self.status.operation_name.is_empty() {
            self.status.operation_name = naming::requirement_operation_name(&self.name);
        }

        let Some(op) = self
            .ctx
            .kube
            .get_operation(&self.status.operation_name, &self.namespace)
            .await?
        else {
            self.status.cache_key = key;
            let op = self.new_operation()?;
            self.ctx.kube.create_operation(&op).await?;
            info!(operation = %self.status.operation_name, "operation created");
            return Ok(Step::requeue());
        };

        if key != self.status.cache_key {
            self.push_template(key).await?;
            return Ok(Step::requeue());
        }

        let op_key = op
            .status
            .as_ref()
            .map(|s| s.cache_key.as_str())
            .unwrap_or_default();
        if !op.is_reconciled() || op_key != self.status.cache_key {
            debug!(operation = %op.name_any(), phase = %op.phase(), "waiting for operation");
            return Ok(Step::requeue());
        }

        if let Some(status) = &op.status {
            self.status.operation_id = status.operation_id.clone();
        }
        self.mark(
            condition_types::OPERATION_READY,
            ConditionStatus::True,
            condition_reasons::CACHE_MISS,
            "operation reconciled",
        );
        self.set_phase(RequirementPhase::Ready);
        Ok(Step::Continue)
    }

    /// Write the current template into the bound Operation and adopt `key`
    async fn push_template(&mut self, key: String) -> Result<(), Error> {
        info!(old = %self.status.cache_key, new = %key, operation = %self.status.operation_name, "template changed");
        self.ctx
            .kube
            .patch_operation_spec(
                &self.status.operation_name,
                &self.namespace,
                &self.req.spec.template,
            )
            .await?;
        self.publish(
            EventType::Normal,
            reasons::SPEC_DRIFT,
            actions::RECONCILE,
            format!("cache key changed to {key}"),
        )
        .await;
        self.status.cache_key = key;
        Ok(())
    }

    fn new_operation(&self) -> Result<Operation, Error> {
        Ok(Operation {
            metadata: ObjectMeta {
                name: Some(self.status.operation_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels()),
                owner_references: Some(vec![controller_owner_ref(self.req)?]),
                ..Default::default()
            },
            spec: self.req.spec.template.clone(),
            status: None,
        })
    }

    fn ensure_deletion_finished(&mut self) -> StepResult {
        if self.status.phase != RequirementPhase::Deleting {
            return Ok(Step::Continue);
        }
        self.set_phase(RequirementPhase::Deleted);
        Ok(Step::requeue())
    }
}
