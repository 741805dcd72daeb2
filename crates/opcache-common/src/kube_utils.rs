//! Kubernetes utilities shared by the controller client implementations
//!
//! All helpers are generic over namespaced resources. Reads map 404 to
//! `None`, deletes and status patches tolerate 404, and 409 surfaces as
//! [`Error::Conflict`] tagged with the object name.

use std::fmt::Debug;

use futures::future::{join_all, BoxFuture};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::is_not_found;
use crate::{Error, FIELD_MANAGER};

/// Bounds shared by every custom and native kind the controllers touch
pub trait NamespacedResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedResource for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static
{
}

fn api<K: NamespacedResource>(client: &Client, namespace: &str) -> Api<K> {
    Api::namespaced(client.clone(), namespace)
}

/// Get an object, `None` if it does not exist
pub async fn get_opt<K: NamespacedResource>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<K>, Error> {
    api::<K>(client, namespace)
        .get_opt(name)
        .await
        .map_err(|e| Error::from(e).on_resource(name))
}

/// Create an object. An existing object with the same name is a conflict.
pub async fn create<K: NamespacedResource>(
    client: &Client,
    namespace: &str,
    obj: &K,
) -> Result<K, Error> {
    let name = obj.name_any();
    debug!(kind = %K::kind(&()), name = %name, "creating object");
    api::<K>(client, namespace)
        .create(&PostParams::default(), obj)
        .await
        .map_err(|e| Error::from(e).on_resource(name))
}

/// Replace an object; the write is rejected if `obj` carries a stale resourceVersion
pub async fn replace<K: NamespacedResource>(
    client: &Client,
    namespace: &str,
    obj: &K,
) -> Result<K, Error> {
    let name = obj.name_any();
    api::<K>(client, namespace)
        .replace(&name, &PostParams::default(), obj)
        .await
        .map_err(|e| Error::from(e).on_resource(name))
}

/// `{ field: value }` as a merge patch body
pub fn merge_patch<K: NamespacedResource>(
    field: &str,
    value: &impl Serialize,
) -> Result<serde_json::Value, Error> {
    let value = serde_json::to_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), format!("{field}: {e}")))?;
    let mut body = serde_json::Map::new();
    body.insert(field.to_string(), value);
    Ok(serde_json::Value::Object(body))
}

/// Merge-patch `spec` of an object
pub async fn patch_spec<K: NamespacedResource>(
    client: &Client,
    name: &str,
    namespace: &str,
    spec: &impl Serialize,
) -> Result<(), Error> {
    let patch = merge_patch::<K>("spec", spec)?;
    api::<K>(client, namespace)
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::from(e).on_resource(name))?;
    Ok(())
}

/// Merge-patch the status sub-resource. A vanished object is not an error.
pub async fn patch_status<K: NamespacedResource>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl Serialize,
) -> Result<(), Error> {
    let patch = merge_patch::<K>("status", status)?;
    match api::<K>(client, namespace)
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => {
            debug!(name = %name, "object gone before status update");
            Ok(())
        }
        Err(e) => Err(Error::from(e).on_resource(name)),
    }
}

/// Delete with background propagation. A missing object is not an error.
pub async fn delete_background<K: NamespacedResource>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<(), Error> {
    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };
    match api::<K>(client, namespace).delete(name, &dp).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::from(e).on_resource(name)),
    }
}

/// Add a finalizer if it is not already present
pub async fn add_finalizer<K: NamespacedResource>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
) -> Result<(), Error> {
    let api = api::<K>(client, namespace);
    let obj = api.get(name).await.map_err(|e| Error::from(e).on_resource(name))?;
    let mut finalizers = obj.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    write_finalizers(&api, name, obj.resource_version(), finalizers).await
}

/// Remove a finalizer. A missing object or finalizer is not an error.
pub async fn remove_finalizer<K: NamespacedResource>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
) -> Result<(), Error> {
    let api = api::<K>(client, namespace);
    let Some(obj) = api
        .get_opt(name)
        .await
        .map_err(|e| Error::from(e).on_resource(name))?
    else {
        return Ok(());
    };
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    write_finalizers(&api, name, obj.resource_version(), finalizers).await
}

async fn write_finalizers<K: NamespacedResource>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<String>,
    finalizers: Vec<String>,
) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": resource_version,
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::from(e).on_resource(name))?;
    Ok(())
}

/// List the objects in `namespace` whose controller owner has `owner_uid`
pub async fn list_owned<K: NamespacedResource>(
    client: &Client,
    namespace: &str,
    owner_uid: &str,
) -> Result<Vec<K>, Error> {
    let list = api::<K>(client, namespace)
        .list(&ListParams::default())
        .await?;
    Ok(list
        .items
        .into_iter()
        .filter(|obj| is_controlled_by(obj.meta(), owner_uid))
        .collect())
}

/// The controller owner reference of an object, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// True when the controller owner reference points at `owner_uid`
pub fn is_controlled_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    controller_of(meta).is_some_and(|r| r.uid == owner_uid)
}

/// Controller owner reference pointing at `owner` (`controller` and
/// `blockOwnerDeletion` set)
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(
    owner: &K,
) -> Result<OwnerReference, Error> {
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner-reference",
            format!(
                "{} {} has no uid yet",
                K::kind(&()),
                owner.meta().name.as_deref().unwrap_or_default()
            ),
        )
    })
}

/// True once the object has a deletion timestamp
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// True when the object carries `finalizer`
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == finalizer)
}

/// Run a batch of requests concurrently and fold every failure into one error.
///
/// Returns how many requests succeeded.
pub async fn join_collect(
    requests: Vec<BoxFuture<'_, Result<(), Error>>>,
) -> Result<usize, Error> {
    let total = requests.len();
    let errors: Vec<Error> = join_all(requests)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();
    let succeeded = total - errors.len();
    for (i, err) in errors.iter().enumerate() {
        tracing::error!(error = %err, index = i, "batched request failed");
    }
    match Error::aggregate(errors) {
        Some(err) => Err(err),
        None => Ok(succeeded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Operation, OperationSpec};
    use futures::FutureExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn merge_patch_wraps_the_field() {
        let patch = merge_patch::<Operation>("spec", &serde_json::json!({ "expireAt": "x" }))
            .expect("serializes");
        assert_eq!(patch, serde_json::json!({ "spec": { "expireAt": "x" } }));
    }

    #[test]
    fn unserializable_patch_is_a_serialization_error() {
        let bad: std::collections::BTreeMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        match merge_patch::<Operation>("status", &bad) {
            Err(Error::Serialization { kind, message }) => {
                assert_eq!(kind.as_deref(), Some("Operation"));
                assert!(message.starts_with("status:"));
            }
            other => panic!("expected serialization error, got {other:?}"),
        }
    }

    fn owner_ref(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "controller.azure.github.com/v1alpha1".to_string(),
            kind: "Cache".to_string(),
            name: "cache-abc".to_string(),
            uid: uid.to_string(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn controller_reference_is_matched_by_uid() {
        let meta = ObjectMeta {
            owner_references: Some(vec![owner_ref("other", false), owner_ref("uid-1", true)]),
            ..Default::default()
        };
        assert!(is_controlled_by(&meta, "uid-1"));
        assert!(!is_controlled_by(&meta, "other"));
        assert_eq!(controller_of(&meta).map(|r| r.uid.as_str()), Some("uid-1"));
    }

    #[test]
    fn no_owner_means_no_controller() {
        assert!(controller_of(&ObjectMeta::default()).is_none());
        assert!(!is_controlled_by(&ObjectMeta::default(), "uid-1"));
    }

    #[test]
    fn owner_ref_requires_uid() {
        let mut op = Operation::new("op", OperationSpec::default());
        assert!(controller_owner_ref(&op).is_err());

        op.metadata.uid = Some("uid-9".to_string());
        let r = controller_owner_ref(&op).expect("uid is set");
        assert_eq!(r.kind, "Operation");
        assert_eq!(r.uid, "uid-9");
        assert_eq!(r.controller, Some(true));
        assert_eq!(r.block_owner_deletion, Some(true));
    }

    #[test]
    fn deletion_and_finalizer_flags() {
        let mut meta = ObjectMeta {
            finalizers: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        assert!(has_finalizer(&meta, "a"));
        assert!(!has_finalizer(&meta, "b"));
        assert!(!is_deleting(&meta));
        meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(is_deleting(&meta));
    }

    #[tokio::test]
    async fn join_collect_counts_successes() {
        let requests: Vec<BoxFuture<'_, Result<(), Error>>> =
            vec![async { Ok(()) }.boxed(), async { Ok(()) }.boxed()];
        assert_eq!(join_collect(requests).await.expect("all succeed"), 2);
    }

    #[tokio::test]
    async fn join_collect_aggregates_failures() {
        let requests: Vec<BoxFuture<'_, Result<(), Error>>> = vec![
            async { Ok(()) }.boxed(),
            async { Err(Error::internal("first")) }.boxed(),
            async { Err(Error::internal("second")) }.boxed(),
        ];
        let err = join_collect(requests).await.unwrap_err();
        assert!(matches!(err, Error::Aggregate { ref errors } if errors.len() == 2));
    }
}
