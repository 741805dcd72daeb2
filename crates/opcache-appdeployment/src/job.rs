//! Provision and teardown Job construction
//!
//! Jobs are built from the user's template. The controller owns retries,
//! cleanup and restart policy, and injects `OPERATION_ID` into every
//! container.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use opcache_common::crd::AppDeployment;
use opcache_common::kube_utils::controller_owner_ref;
use opcache_common::{naming, Error, MANAGED_BY, OPERATION_ID_ENV};

/// Label carrying the owning AppDeployment name
pub const APP_DEPLOYMENT_LABEL: &str = "operation-cache-controller.azure.github.com/app-deployment";

/// Retries before the Job reports Failed
const BACKOFF_LIMIT: i32 = 10;

/// Finished Jobs are garbage collected after an hour
const TTL_SECONDS_AFTER_FINISHED: i32 = 3600;

/// Which of the two AppDeployment Jobs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// Brings the application up
    Provision,
    /// Runs before the AppDeployment is released
    Teardown,
}

impl JobKind {
    /// Job name for an AppDeployment
    pub fn job_name(self, app_deployment: &str) -> String {
        match self {
            Self::Provision => naming::provision_job_name(app_deployment),
            Self::Teardown => naming::teardown_job_name(app_deployment),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// Observed state of a Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Neither succeeded nor failed yet
    Running,
    /// At least one pod succeeded
    Succeeded,
    /// At least one pod failed and none succeeded
    Failed,
}

/// Map a Job's status counters to a [`JobState`]
pub fn job_state(job: &Job) -> JobState {
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        JobState::Succeeded
    } else if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
        JobState::Failed
    } else {
        JobState::Running
    }
}

/// Build the Job of `kind` for `app` from `template`.
///
/// The AppDeployment must already have a UID; it becomes the Job's
/// controller owner.
pub fn build_job(app: &AppDeployment, kind: JobKind, template: &JobSpec) -> Result<Job, Error> {
    let name = app.name_any();

    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(
        APP_DEPLOYMENT_LABEL.to_string(),
        naming::truncate(&name, naming::MAX_NAME_LEN),
    );

    let mut spec = template.clone();
    spec.backoff_limit = Some(BACKOFF_LIMIT);
    spec.ttl_seconds_after_finished = Some(TTL_SECONDS_AFTER_FINISHED);

    if let Some(pod) = spec.template.spec.as_mut() {
        pod.restart_policy = Some("OnFailure".to_string());
        for container in pod.containers.iter_mut() {
            set_env(
                container.env.get_or_insert_with(Vec::new),
                OPERATION_ID_ENV,
                &app.spec.op_id,
            );
        }
    }

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(kind.job_name(&name)),
            namespace: app.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![controller_owner_ref(app)?]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Set `name` to `value`, replacing any existing entry
fn set_env(env: &mut Vec<EnvVar>, name: &str, value: &str) {
    env.retain(|e| e.name != name);
    env.push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use opcache_common::crd::AppDeploymentSpec;

    fn template() -> JobSpec {
        JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some("busybox".to_string()),
                        env: Some(vec![
                            EnvVar {
                                name: "KEEP".to_string(),
                                value: Some("1".to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: OPERATION_ID_ENV.to_string(),
                                value: Some("stale".to_string()),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    fn app(uid: Option<&str>) -> AppDeployment {
        let mut app = AppDeployment::new(
            "op123-web",
            AppDeploymentSpec {
                provision: template(),
                teardown: None,
                op_id: "op123".to_string(),
                dependencies: vec![],
            },
        );
        app.metadata.namespace = Some("team-a".to_string());
        app.metadata.uid = uid.map(str::to_string);
        app
    }

    fn job_with(succeeded: Option<i32>, failed: Option<i32>) -> Job {
        Job {
            status: Some(JobStatus {
                succeeded,
                failed,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn job_state_mapping() {
        assert_eq!(job_state(&Job::default()), JobState::Running);
        assert_eq!(job_state(&job_with(Some(0), Some(0))), JobState::Running);
        assert_eq!(job_state(&job_with(Some(1), None)), JobState::Succeeded);
        assert_eq!(job_state(&job_with(None, Some(2))), JobState::Failed);
        assert_eq!(job_state(&job_with(Some(1), Some(3))), JobState::Succeeded);
    }

    #[test]
    fn build_sets_controller_fields() {
        let job = build_job(&app(Some("uid-1")), JobKind::Provision, &template())
            .expect("app has a uid");
        assert_eq!(job.metadata.name.as_deref(), Some("provision-op123-web"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("team-a"));

        let owners = job.metadata.owner_references.expect("owner set");
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-1");
        assert_eq!(owners[0].controller, Some(true));

        let labels = job.metadata.labels.expect("labels set");
        assert_eq!(labels.get(APP_DEPLOYMENT_LABEL).map(String::as_str), Some("op123-web"));
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by").map(String::as_str),
            Some(MANAGED_BY)
        );

        let spec = job.spec.expect("spec set");
        assert_eq!(spec.backoff_limit, Some(10));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));
        let pod = spec.template.spec.expect("pod spec");
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
    }

    #[test]
    fn operation_id_is_overwritten() {
        let job = build_job(&app(Some("uid-1")), JobKind::Teardown, &template())
            .expect("app has a uid");
        assert_eq!(job.metadata.name.as_deref(), Some("teardown-op123-web"));

        let pod = job.spec.and_then(|s| s.template.spec).expect("pod spec");
        let env = pod.containers[0].env.clone().unwrap_or_default();
        let ids: Vec<_> = env.iter().filter(|e| e.name == OPERATION_ID_ENV).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].value.as_deref(), Some("op123"));
        assert!(env.iter().any(|e| e.name == "KEEP"));
    }

    #[test]
    fn build_requires_uid() {
        assert!(build_job(&app(None), JobKind::Provision, &template()).is_err());
    }
}
