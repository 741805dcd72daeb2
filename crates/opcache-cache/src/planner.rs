//! Warm pool planning
//!
//! Given the Operations a Cache owns and the keep-alive target, decide which
//! Operations to delete and how many to create. Planning is pure; the
//! controller applies the plan.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use opcache_common::crd::{Cache, Operation};
use opcache_common::kube_utils::controller_owner_ref;
use opcache_common::{naming, Error, CACHE_KEY_LABEL, CACHE_MODE_ANNOTATION, MANAGED_BY};

/// Changes that bring a warm pool to its keep-alive target
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PoolPlan {
    /// Owned Operations that are Reconciled, in listing order
    pub available: Vec<String>,
    /// Operations to delete: the surplus Reconciled ones plus every one not yet
    /// Reconciled
    pub delete: Vec<String>,
    /// Number of warm Operations to create
    pub create: usize,
}

impl PoolPlan {
    /// Reconciled Operations that survive the plan
    pub fn remaining_available(&self) -> Vec<String> {
        self.available
            .iter()
            .filter(|name| !self.delete.contains(name))
            .cloned()
            .collect()
    }

    /// True when the pool is already at its target
    pub fn is_noop(&self) -> bool {
        self.delete.is_empty() && self.create == 0
    }
}

/// Plan the pool for `owned` Operations against `keep_alive`.
///
/// * surplus (more Reconciled than `keep_alive`): delete the extra Reconciled
///   Operations and every owned Operation still in flight
/// * deficit: create enough to bring the owned count up to `keep_alive`; when
///   enough are already in flight, wait for them
pub fn plan(owned: &[Operation], keep_alive: usize) -> PoolPlan {
    let (ready, pending): (Vec<&Operation>, Vec<&Operation>) =
        owned.iter().partition(|op| op.is_reconciled());
    let available: Vec<String> = ready.iter().map(|op| op.name_any()).collect();

    let mut result = PoolPlan {
        available,
        ..Default::default()
    };

    if result.available.len() > keep_alive {
        let surplus = result.available.len() - keep_alive;
        result.delete = result.available.iter().take(surplus).cloned().collect();
        result.delete.extend(pending.iter().map(|op| op.name_any()));
    } else if result.available.len() < keep_alive && owned.len() < keep_alive {
        result.create = keep_alive - owned.len();
    }

    result
}

/// Warm Operation for `cache` with the given name.
///
/// The Cache becomes its controller owner, so the Cache must have a UID.
pub fn build_warm_operation(cache: &Cache, cache_key: &str, name: String) -> Result<Operation, Error> {
    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        ),
        (
            CACHE_KEY_LABEL.to_string(),
            naming::cache_key_label_value(cache_key),
        ),
    ]);
    let annotations = BTreeMap::from([(CACHE_MODE_ANNOTATION.to_string(), "true".to_string())]);

    Ok(Operation {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cache.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![controller_owner_ref(cache)?]),
            ..Default::default()
        },
        spec: cache.spec.operation_template.clone(),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcache_common::crd::{CacheSpec, OperationPhase, OperationSpec, OperationStatus};

    fn op(name: &str, phase: OperationPhase) -> Operation {
        let mut op = Operation::new(name, OperationSpec::default());
        op.status = Some(OperationStatus {
            phase,
            ..Default::default()
        });
        op
    }

    fn pool(ready: usize, reconciling: usize) -> Vec<Operation> {
        let mut ops: Vec<Operation> = (0..ready)
            .map(|i| op(&format!("ready-{i}"), OperationPhase::Reconciled))
            .collect();
        ops.extend((0..reconciling).map(|i| op(&format!("pending-{i}"), OperationPhase::Reconciling)));
        ops
    }

    #[test]
    fn balanced_pool_is_left_alone() {
        let plan = plan(&pool(3, 0), 3);
        assert!(plan.is_noop());
        assert_eq!(plan.available.len(), 3);
    }

    #[test]
    fn deficit_counts_in_flight_operations() {
        let plan = plan(&pool(0, 1), 3);
        assert_eq!(plan.create, 2);
        assert!(plan.delete.is_empty());
        assert!(plan.available.is_empty());
    }

    #[test]
    fn deficit_waits_when_enough_are_in_flight() {
        let plan = plan(&pool(1, 4), 3);
        assert!(plan.is_noop());
    }

    #[test]
    fn surplus_deletes_extras_and_pending() {
        let plan = plan(&pool(4, 1), 2);
        assert_eq!(plan.create, 0);
        assert_eq!(plan.delete, vec!["ready-0", "ready-1", "pending-0"]);
        assert_eq!(plan.remaining_available(), vec!["ready-2", "ready-3"]);
    }

    #[test]
    fn empty_pool_is_filled() {
        let plan = plan(&[], 5);
        assert_eq!(plan.create, 5);
    }

    #[test]
    fn warm_operation_is_marked_and_owned() {
        let mut cache = Cache::new(
            "cache-abc",
            CacheSpec {
                operation_template: OperationSpec {
                    applications: vec![],
                    expire_at: Some("2030-01-01T00:00:00Z".to_string()),
                },
                ..Default::default()
            },
        );
        cache.metadata.namespace = Some("team-a".to_string());
        cache.metadata.uid = Some("cache-uid".to_string());

        let key = "a".repeat(64);
        let op = build_warm_operation(&cache, &key, "cached-operation-aaaaaaaa-xyzab".to_string())
            .expect("cache has a uid");

        assert_eq!(op.namespace().as_deref(), Some("team-a"));
        assert_eq!(
            op.annotations().get(CACHE_MODE_ANNOTATION).map(String::as_str),
            Some("true")
        );
        assert_eq!(op.labels().get(CACHE_KEY_LABEL).map(String::len), Some(63));
        let owner = &op.owner_references()[0];
        assert_eq!(owner.uid, "cache-uid");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(op.spec, cache.spec.operation_template);
    }

    #[test]
    fn warm_operation_requires_cache_uid() {
        let cache = Cache::new("cache-abc", CacheSpec::default());
        assert!(build_warm_operation(&cache, "k", "n".to_string()).is_err());
    }
}
