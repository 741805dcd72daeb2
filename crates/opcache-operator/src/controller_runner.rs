//! Controller runner - builds one controller future per resource kind
//!
//! Each controller owns the kind it creates, so a change to a Job wakes its
//! AppDeployment, a change to an AppDeployment wakes its Operation, and a
//! change to an Operation wakes whichever Cache or Requirement controls it.
//! An acquisition rewrites the Operation's controller reference, which wakes
//! both the old and the new owner.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use opcache_appdeployment::AppDeploymentContext;
use opcache_cache::CacheContext;
use opcache_common::crd::{AppDeployment, Cache, Operation, Requirement};
use opcache_common::kube_utils::NamespacedResource;
use opcache_operation::OperationContext;
use opcache_requirement::RequirementContext;

use crate::config::Cli;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so idle watches are closed by the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be joined
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Api over one namespace, or over all of them
fn scoped_api<K: NamespacedResource>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Build the four controllers
pub fn build_controllers(client: Client, cli: &Cli) -> Vec<ControllerFuture> {
    let ns = cli.namespace.as_deref();
    match ns {
        Some(ns) => tracing::info!(namespace = %ns, "watching a single namespace"),
        None => tracing::info!("watching all namespaces"),
    }

    tracing::info!("- AppDeployment controller");
    let app_ctrl = Controller::new(scoped_api::<AppDeployment>(&client, ns), watcher_config())
        .owns(scoped_api::<Job>(&client, ns), watcher_config())
        .with_config(ControllerConfig::default().concurrency(cli.appdeployment_concurrency))
        .shutdown_on_signal()
        .run(
            opcache_appdeployment::reconcile,
            opcache_appdeployment::error_policy,
            Arc::new(AppDeploymentContext::from_client(client.clone())),
        )
        .for_each(log_reconcile_result("AppDeployment"));

    tracing::info!("- Operation controller");
    let op_ctrl = Controller::new(scoped_api::<Operation>(&client, ns), watcher_config())
        .owns(scoped_api::<AppDeployment>(&client, ns), watcher_config())
        .with_config(ControllerConfig::default().concurrency(cli.operation_concurrency))
        .shutdown_on_signal()
        .run(
            opcache_operation::reconcile,
            opcache_operation::error_policy,
            Arc::new(OperationContext::from_client(client.clone())),
        )
        .for_each(log_reconcile_result("Operation"));

    tracing::info!(keep_alive = cli.keep_alive_count, "- Cache controller");
    let cache_ctrl = Controller::new(scoped_api::<Cache>(&client, ns), watcher_config())
        .owns(scoped_api::<Operation>(&client, ns), watcher_config())
        .with_config(ControllerConfig::default().concurrency(cli.cache_concurrency))
        .shutdown_on_signal()
        .run(
            opcache_cache::reconcile,
            opcache_cache::error_policy,
            Arc::new(CacheContext::from_client(
                client.clone(),
                cli.keep_alive_count,
                cli.cache_resync(),
            )),
        )
        .for_each(log_reconcile_result("Cache"));

    tracing::info!("- Requirement controller");
    let req_ctrl = Controller::new(scoped_api::<Requirement>(&client, ns), watcher_config())
        .owns(scoped_api::<Operation>(&client, ns), watcher_config())
        .with_config(ControllerConfig::default().concurrency(cli.requirement_concurrency))
        .shutdown_on_signal()
        .run(
            opcache_requirement::reconcile,
            opcache_requirement::error_policy,
            Arc::new(RequirementContext::from_client(
                client,
                cli.cache_ttl(),
                cli.requirement_resync(),
            )),
        )
        .for_each(log_reconcile_result("Requirement"));

    vec![
        Box::pin(app_ctrl),
        Box::pin(op_ctrl),
        Box::pin(cache_ctrl),
        Box::pin(req_ctrl),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => tracing::debug!(?object, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
