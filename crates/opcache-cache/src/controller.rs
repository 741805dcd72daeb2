//! Cache reconciliation
//!
//! Pipeline: `checkExpiry → ensureInitialized → calculateKeepAliveCount →
//! adjustCache`. The Cache resyncs on a fixed interval so the pool refills
//! even when nothing it watches changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use opcache_common::crd::{Cache, CacheStatus, Operation};
use opcache_common::events::{actions, reasons, EventPublisher};
use opcache_common::fingerprint::fingerprint;
use opcache_common::kube_utils::{self, join_collect};
use opcache_common::metrics::{self, ReconcileTimer};
use opcache_common::pipeline::{error_action, requeue_on_conflict, settle};
use opcache_common::{naming, timestamp, Error, KubeEventPublisher, Step, StepResult};
#[cfg(test)]
use opcache_common::NoopEventPublisher;

use crate::planner::{build_warm_operation, plan};

/// Controller name used for events and metrics
pub const CONTROLLER_NAME: &str = "cache-controller";

const METRICS_LABEL: &str = "cache";

/// Warm pool size when none is configured
pub const DEFAULT_KEEP_ALIVE_COUNT: usize = 5;

/// Periodic resync when none is configured
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(60);

/// Kubernetes operations the Cache controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheKubeClient: Send + Sync {
    /// Merge-patch the status of a Cache
    async fn patch_cache_status(
        &self,
        name: &str,
        namespace: &str,
        status: &CacheStatus,
    ) -> Result<(), Error>;

    /// Delete a Cache
    async fn delete_cache(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Operations whose controller owner has `owner_uid`
    async fn list_owned_operations(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Operation>, Error>;

    /// Create an Operation in its own namespace
    async fn create_operation(&self, op: &Operation) -> Result<(), Error>;

    /// Delete an Operation in the background
    async fn delete_operation(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// [`CacheKubeClient`] backed by the API server
pub struct CacheKubeClientImpl {
    client: Client,
}

impl CacheKubeClientImpl {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CacheKubeClient for CacheKubeClientImpl {
    async fn patch_cache_status(
        &self,
        name: &str,
        namespace: &str,
        status: &CacheStatus,
    ) -> Result<(), Error> {
        kube_utils::patch_status::<Cache>(&self.client, name, namespace, status).await
    }

    async fn delete_cache(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::delete_background::<Cache>(&self.client, name, namespace).await
    }

    async fn list_owned_operations(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Operation>, Error> {
        kube_utils::list_owned(&self.client, namespace, owner_uid).await
    }

    async fn create_operation(&self, op: &Operation) -> Result<(), Error> {
        let namespace = op.namespace().unwrap_or_default();
        kube_utils::create(&self.client, &namespace, op).await?;
        Ok(())
    }

    async fn delete_operation(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::delete_background::<Operation>(&self.client, name, namespace).await
    }
}

/// Shared state for Cache reconciles
pub struct CacheContext {
    /// Kubernetes access
    pub kube: Arc<dyn CacheKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Warm pool size every Cache converges on
    pub keep_alive_count: usize,
    /// Requeue interval after a clean pass
    pub resync: Duration,
}

impl CacheContext {
    /// Create a context from its parts
    pub fn new(
        kube: Arc<dyn CacheKubeClient>,
        events: Arc<dyn EventPublisher>,
        keep_alive_count: usize,
        resync: Duration,
    ) -> Self {
        Self {
            kube,
            events,
            keep_alive_count,
            resync,
        }
    }

    /// Create a production context from a client
    pub fn from_client(client: Client, keep_alive_count: usize, resync: Duration) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(CacheKubeClientImpl::new(client)),
            events,
            keep_alive_count,
            resync,
        )
    }

    /// Create a context with a mock client, no events and default settings
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn CacheKubeClient>) -> Self {
        Self::new(
            kube,
            Arc::new(NoopEventPublisher),
            DEFAULT_KEEP_ALIVE_COUNT,
            DEFAULT_RESYNC,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    CheckExpiry,
    EnsureInitialized,
    CalculateKeepAliveCount,
    AdjustCache,
}

impl Stage {
    const PIPELINE: [Stage; 4] = [
        Stage::CheckExpiry,
        Stage::EnsureInitialized,
        Stage::CalculateKeepAliveCount,
        Stage::AdjustCache,
    ];

    fn name(self) -> &'static str {
        match self {
            Stage::CheckExpiry => "checkExpiry",
            Stage::EnsureInitialized => "ensureInitialized",
            Stage::CalculateKeepAliveCount => "calculateKeepAliveCount",
            Stage::AdjustCache => "adjustCache",
        }
    }
}

/// Reconcile a Cache
#[instrument(skip(cache, ctx), fields(cache = %cache.name_any(), namespace = %cache.namespace().unwrap_or_default()))]
pub async fn reconcile(cache: Arc<Cache>, ctx: Arc<CacheContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(METRICS_LABEL);
    let result = reconcile_inner(&cache, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

async fn reconcile_inner(cache: &Cache, ctx: &CacheContext) -> Result<Action, Error> {
    let name = cache.name_any();
    let namespace = cache
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Cache must be namespaced"))?;

    let mut pass = Pass {
        cache,
        ctx,
        name,
        namespace,
        status: cache.status.clone().unwrap_or_default(),
    };

    let outcome = pass.run().await;
    let persisted = pass.persist().await;
    settle(outcome, persisted).map(|step| step.into_action(Action::requeue(ctx.resync)))
}

/// Error policy: log by error kind and requeue after the fixed delay
pub fn error_policy(cache: Arc<Cache>, error: &Error, _ctx: Arc<CacheContext>) -> Action {
    error_action(CONTROLLER_NAME, &cache.name_any(), error)
}

struct Pass<'a> {
    cache: &'a Cache,
    ctx: &'a CacheContext,
    name: String,
    namespace: String,
    status: CacheStatus,
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
            Stage::CheckExpiry => self.check_expiry().await,
            Stage::EnsureInitialized => self.ensure_initialized(),
            Stage::CalculateKeepAliveCount => self.calculate_keep_alive_count(),
            Stage::AdjustCache => self.adjust_cache().await,
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        if self.cache.status.clone().unwrap_or_default() == self.status {
            return Ok(());
        }
        self.ctx
            .kube
            .patch_cache_status(&self.name, &self.namespace, &self.status)
            .await
    }

    async fn check_expiry(&mut self) -> StepResult {
        let Some(expire_time) = self.cache.spec.expire_time.as_deref() else {
            return Ok(Step::Continue);
        };
        match timestamp::is_past(expire_time, Utc::now()) {
            Ok(true) => {
                info!(expire_time, "cache expired, deleting");
                self.ctx
                    .events
                    .publish(
                        &self.cache.object_ref(&()),
                        EventType::Normal,
                        reasons::EXPIRED,
                        actions::DELETE,
                        Some(format!("expired at {expire_time}")),
                    )
                    .await;
                self.ctx.kube.delete_cache(&self.name, &self.namespace).await?;
                Ok(Step::Cancel)
            }
            Ok(false) => Ok(Step::Continue),
            Err(e) => {
                warn!(error = %e, "ignoring unparseable expireTime");
                Ok(Step::Continue)
            }
        }
    }

    fn ensure_initialized(&mut self) -> StepResult {
        if self.status.cache_key.is_empty() {
            self.status.cache_key = fingerprint(&self.cache.spec.operation_template.applications);
            info!(cache_key = %self.status.cache_key, "cache initialized");
        }
        Ok(Step::Continue)
    }

    fn calculate_keep_alive_count(&mut self) -> StepResult {
        self.status.keep_alive_count =
            i32::try_from(self.ctx.keep_alive_count).unwrap_or(i32::MAX);
        Ok(Step::Continue)
    }

    async fn adjust_cache(&mut self) -> StepResult {
        let uid = self
            .cache
            .uid()
            .ok_or_else(|| Error::internal_with_context("cache", "Cache has no uid"))?;
        let owned = self
            .ctx
            .kube
            .list_owned_operations(&self.namespace, &uid)
            .await?;
        let plan = plan(&owned, self.ctx.keep_alive_count);

        self.status.available_caches = plan.remaining_available();
        metrics::record_cache_available(&self.name, self.status.available_caches.len());

        if plan.is_noop() {
            debug!(
                owned = owned.len(),
                available = plan.available.len(),
                "warm pool balanced"
            );
            return Ok(Step::Continue);
        }

        let warm = (0..plan.create)
            .map(|_| {
                build_warm_operation(
                    self.cache,
                    &self.status.cache_key,
                    naming::warm_operation_name(&self.status.cache_key),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            owned = owned.len(),
            available = plan.available.len(),
            create = warm.len(),
            delete = plan.delete.len(),
            "scaling warm pool"
        );

        let deleted = join_collect(
            plan.delete
                .iter()
                .map(|name| self.ctx.kube.delete_operation(name, &self.namespace))
                .collect(),
        )
        .await?;
        let created = join_collect(
            warm.iter()
                .map(|op| self.ctx.kube.create_operation(op))
                .collect(),
        )
        .await?;

        metrics::record_warm_pool_change(created, deleted);
        self.ctx
            .events
            .publish(
                &self.cache.object_ref(&()),
                EventType::Normal,
                reasons::WARM_POOL_SCALED,
                actions::SCALE,
                Some(format!("created {created}, deleted {deleted}")),
            )
            .await;
        Ok(Step::Continue)
    }
}
