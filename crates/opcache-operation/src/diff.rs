//! Expected vs. current AppDeployments of an Operation
//!
//! Two AppDeployments are equivalent when their provision Jobs match after
//! sorting every container's env by name, and their dependency lists match
//! after sorting. Teardown templates are not compared.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use opcache_common::crd::{AppDeployment, AppDeploymentSpec, Operation};
use opcache_common::kube_utils::controller_owner_ref;
use opcache_common::{naming, Error, MANAGED_BY};

/// Changes needed to bring the current AppDeployments to the expected set
#[derive(Debug, Default)]
pub struct AppDeploymentDiff {
    /// Expected but missing
    pub added: Vec<AppDeployment>,
    /// Present but no longer expected
    pub removed: Vec<AppDeployment>,
    /// Present with a different payload; carries the current metadata and the
    /// expected spec, ready to be written back
    pub updated: Vec<AppDeployment>,
}

impl AppDeploymentDiff {
    /// True when nothing needs to change
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// AppDeployments an Operation should own, one per application
pub fn expected_app_deployments(op: &Operation, op_id: &str) -> Result<Vec<AppDeployment>, Error> {
    let owner = controller_owner_ref(op)?;
    let labels = BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    )]);

    Ok(op
        .spec
        .applications
        .iter()
        .map(|app| AppDeployment {
            metadata: ObjectMeta {
                name: Some(naming::app_deployment_name(op_id, &app.name)),
                namespace: op.namespace(),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            spec: AppDeploymentSpec {
                provision: app.provision.clone(),
                teardown: app.teardown.clone(),
                op_id: op_id.to_string(),
                dependencies: app.dependencies.clone(),
            },
            status: None,
        })
        .collect())
}

/// Split `expected` and `current` into added, removed and updated sets
pub fn diff(expected: &[AppDeployment], current: &[AppDeployment]) -> AppDeploymentDiff {
    let current_by_name: HashMap<String, &AppDeployment> =
        current.iter().map(|a| (a.name_any(), a)).collect();
    let expected_by_name: HashMap<String, &AppDeployment> =
        expected.iter().map(|a| (a.name_any(), a)).collect();

    let mut result = AppDeploymentDiff::default();

    for want in expected {
        match current_by_name.get(&want.name_any()) {
            None => result.added.push(want.clone()),
            Some(have) if !same_payload(&want.spec, &have.spec) => {
                let mut updated = (*have).clone();
                updated.spec = want.spec.clone();
                result.updated.push(updated);
            }
            Some(_) => {}
        }
    }

    result.removed = current
        .iter()
        .filter(|have| !expected_by_name.contains_key(&have.name_any()))
        .cloned()
        .collect();

    result
}

/// Payload equality used to decide whether an AppDeployment needs an update
pub fn same_payload(a: &AppDeploymentSpec, b: &AppDeploymentSpec) -> bool {
    normalized_job(&a.provision) == normalized_job(&b.provision)
        && sorted(&a.dependencies) == sorted(&b.dependencies)
}

fn normalized_job(job: &JobSpec) -> JobSpec {
    let mut job = job.clone();
    if let Some(pod) = job.template.spec.as_mut() {
        for container in pod.containers.iter_mut() {
            if let Some(env) = container.env.as_mut() {
                env.sort_by(|x, y| x.name.cmp(&y.name));
            }
        }
    }
    job
}

fn sorted(items: &[String]) -> Vec<&str> {
    let mut items: Vec<&str> = items.iter().map(String::as_str).collect();
    items.sort_unstable();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
    use opcache_common::crd::{ApplicationSpec, OperationSpec};

    const OP_ID: &str = "0123456789abcdef0123456789abcdef";

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    fn job(image: &str, env_vars: Vec<EnvVar>) -> JobSpec {
        JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some(image.to_string()),
                        env: Some(env_vars),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    fn application(name: &str, image: &str, deps: &[&str]) -> ApplicationSpec {
        ApplicationSpec {
            name: name.to_string(),
            provision: job(image, vec![env("A", "1"), env("B", "2")]),
            teardown: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn operation(apps: Vec<ApplicationSpec>) -> Operation {
        let mut op = Operation::new(
            "op",
            OperationSpec {
                applications: apps,
                expire_at: None,
            },
        );
        op.metadata.namespace = Some("test".to_string());
        op.metadata.uid = Some("op-uid".to_string());
        op
    }

    #[test]
    fn expected_names_are_scoped_by_operation_id() {
        let op = operation(vec![application("web", "web:1", &["db"]), application("db", "pg", &[])]);
        let expected = expected_app_deployments(&op, OP_ID).expect("uid is set");

        assert_eq!(expected.len(), 2);
        assert_eq!(expected[0].name_any(), format!("{OP_ID}-web"));
        assert_eq!(expected[0].namespace().as_deref(), Some("test"));
        assert_eq!(expected[0].spec.op_id, OP_ID);
        assert_eq!(expected[0].spec.dependencies, vec!["db".to_string()]);
        let owner = &expected[0].owner_references()[0];
        assert_eq!(owner.uid, "op-uid");
        assert_eq!(owner.kind, "Operation");
    }

    #[test]
    fn empty_current_means_everything_is_added() {
        let op = operation(vec![application("web", "web:1", &[]), application("db", "pg", &[])]);
        let expected = expected_app_deployments(&op, OP_ID).expect("uid is set");

        let d = diff(&expected, &[]);
        assert_eq!(d.added.len(), 2);
        assert!(d.removed.is_empty());
        assert!(d.updated.is_empty());
    }

    #[test]
    fn identical_sets_need_nothing() {
        let op = operation(vec![application("web", "web:1", &["db", "cache"])]);
        let expected = expected_app_deployments(&op, OP_ID).expect("uid is set");
        assert!(diff(&expected, &expected).is_empty());
    }

    #[test]
    fn env_and_dependency_order_are_ignored() {
        let mut a = AppDeploymentSpec {
            provision: job("web:1", vec![env("A", "1"), env("B", "2")]),
            teardown: None,
            op_id: OP_ID.to_string(),
            dependencies: vec!["db".to_string(), "cache".to_string()],
        };
        let b = AppDeploymentSpec {
            provision: job("web:1", vec![env("B", "2"), env("A", "1")]),
            dependencies: vec!["cache".to_string(), "db".to_string()],
            ..a.clone()
        };
        assert!(same_payload(&a, &b));

        a.provision = job("web:2", vec![env("A", "1"), env("B", "2")]);
        assert!(!same_payload(&a, &b));
    }

    #[test]
    fn changed_and_stale_apps_are_classified() {
        let old = operation(vec![application("web", "web:1", &[]), application("legacy", "old", &[])]);
        let mut current = expected_app_deployments(&old, OP_ID).expect("uid is set");
        current[0].metadata.resource_version = Some("42".to_string());

        let new = operation(vec![application("web", "web:2", &[]), application("db", "pg", &[])]);
        let expected = expected_app_deployments(&new, OP_ID).expect("uid is set");

        let d = diff(&expected, &current);
        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].name_any(), format!("{OP_ID}-db"));
        assert_eq!(d.removed.len(), 1);
        assert_eq!(d.removed[0].name_any(), format!("{OP_ID}-legacy"));
        assert_eq!(d.updated.len(), 1);

        let updated = &d.updated[0];
        assert_eq!(updated.resource_version().as_deref(), Some("42"));
        let image = updated
            .spec
            .provision
            .template
            .spec
            .as_ref()
            .and_then(|p| p.containers[0].image.clone());
        assert_eq!(image.as_deref(), Some("web:2"));
    }
}
