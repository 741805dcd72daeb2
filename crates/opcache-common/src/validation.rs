//! Job template constraints
//!
//! User job templates must describe a single plain container. Everything the
//! controller manages itself (retries, TTL, parallelism, selectors) and
//! anything that would make the template non-portable (volumes, init
//! containers, fixed pod identity) is rejected. Application names must be
//! unique within an Operation, since each one names an AppDeployment.

use std::collections::HashSet;

use k8s_openapi::api::batch::v1::JobSpec;

use crate::crd::{AppDeploymentSpec, ApplicationSpec};
use crate::Error;

/// Reject an application set that uses a name twice
pub fn validate_application_names(resource: &str, apps: &[ApplicationSpec]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for (i, app) in apps.iter().enumerate() {
        if !seen.insert(app.name.as_str()) {
            return Err(Error::validation_for_field(
                resource,
                format!("spec.applications[{i}].name"),
                format!("duplicate application name {:?}", app.name),
            ));
        }
    }
    Ok(())
}

/// Validate both job templates of an AppDeployment
pub fn validate_app_deployment(name: &str, spec: &AppDeploymentSpec) -> Result<(), Error> {
    validate_job_spec(name, "spec.provision", &spec.provision)?;
    if let Some(teardown) = &spec.teardown {
        validate_job_spec(name, "spec.teardown", teardown)?;
    }
    Ok(())
}

/// Validate one job template; `path` prefixes the field in the error
pub fn validate_job_spec(resource: &str, path: &str, job: &JobSpec) -> Result<(), Error> {
    let reject = |field: &str, msg: &str| {
        Err(Error::validation_for_field(
            resource,
            format!("{path}.{field}"),
            msg,
        ))
    };

    for (field, set) in controller_owned_fields(job) {
        if set {
            return reject(field, "field is managed by the controller and must not be set");
        }
    }

    if let Some(meta) = &job.template.metadata {
        if meta.name.is_some() {
            return reject("template.metadata.name", "pod name must not be set");
        }
        if meta.namespace.is_some() {
            return reject("template.metadata.namespace", "pod namespace must not be set");
        }
    }

    let Some(pod) = &job.template.spec else {
        return reject("template.spec", "pod spec is required");
    };

    if pod.containers.len() != 1 {
        return reject(
            "template.spec.containers",
            &format!("exactly one container is required, found {}", pod.containers.len()),
        );
    }
    if pod.init_containers.as_ref().is_some_and(|c| !c.is_empty()) {
        return reject("template.spec.initContainers", "init containers are not allowed");
    }
    if pod.volumes.as_ref().is_some_and(|v| !v.is_empty()) {
        return reject("template.spec.volumes", "volumes are not allowed");
    }

    let container = &pod.containers[0];
    if container.image.as_deref().unwrap_or_default().is_empty() {
        return reject("template.spec.containers[0].image", "image must not be empty");
    }
    if container.volume_mounts.as_ref().is_some_and(|v| !v.is_empty()) {
        return reject(
            "template.spec.containers[0].volumeMounts",
            "volume mounts are not allowed",
        );
    }

    Ok(())
}

/// Job-level fields the controller owns, paired with whether the user set them
fn controller_owned_fields(job: &JobSpec) -> [(&'static str, bool); 15] {
    [
        ("activeDeadlineSeconds", job.active_deadline_seconds.is_some()),
        ("backoffLimit", job.backoff_limit.is_some()),
        ("backoffLimitPerIndex", job.backoff_limit_per_index.is_some()),
        ("completions", job.completions.is_some()),
        ("completionMode", job.completion_mode.is_some()),
        ("managedBy", job.managed_by.is_some()),
        ("manualSelector", job.manual_selector.is_some()),
        ("maxFailedIndexes", job.max_failed_indexes.is_some()),
        ("parallelism", job.parallelism.is_some()),
        ("podFailurePolicy", job.pod_failure_policy.is_some()),
        ("podReplacementPolicy", job.pod_replacement_policy.is_some()),
        ("selector", job.selector.is_some()),
        ("ttlSecondsAfterFinished", job.ttl_seconds_after_finished.is_some()),
        ("successPolicy", job.success_policy.is_some()),
        ("suspend", job.suspend.is_some()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Volume, VolumeMount};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn container(image: &str) -> Container {
        Container {
            name: "main".to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    fn job(containers: Vec<Container>) -> JobSpec {
        JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    fn field_of(err: Error) -> String {
        match err {
            Error::Validation { field, .. } => field.unwrap_or_default(),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn duplicate_application_names_are_rejected() {
        let app = |name: &str| ApplicationSpec {
            name: name.to_string(),
            ..Default::default()
        };
        assert!(validate_application_names("op", &[app("web"), app("db")]).is_ok());
        let err = validate_application_names("op", &[app("web"), app("db"), app("web")])
            .expect_err("duplicate");
        assert_eq!(field_of(err), "spec.applications[2].name");
    }

    #[test]
    fn single_plain_container_is_valid() {
        assert!(validate_job_spec("app", "spec.provision", &job(vec![container("busybox")])).is_ok());
    }

    #[test]
    fn container_count_must_be_one() {
        let err = validate_job_spec("app", "spec.provision", &job(vec![])).unwrap_err();
        assert_eq!(field_of(err), "spec.provision.template.spec.containers");

        let two = job(vec![container("a"), container("b")]);
        assert!(validate_job_spec("app", "spec.provision", &two).is_err());
    }

    #[test]
    fn image_is_required() {
        let err = validate_job_spec("app", "spec.provision", &job(vec![container("")])).unwrap_err();
        assert_eq!(field_of(err), "spec.provision.template.spec.containers[0].image");
    }

    #[test]
    fn storage_is_rejected() {
        let mut with_mount = container("busybox");
        with_mount.volume_mounts = Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }]);
        assert!(validate_job_spec("app", "spec.provision", &job(vec![with_mount])).is_err());

        let mut with_volume = job(vec![container("busybox")]);
        if let Some(pod) = with_volume.template.spec.as_mut() {
            pod.volumes = Some(vec![Volume {
                name: "data".to_string(),
                ..Default::default()
            }]);
        }
        let err = validate_job_spec("app", "spec.provision", &with_volume).unwrap_err();
        assert_eq!(field_of(err), "spec.provision.template.spec.volumes");

        let mut with_init = job(vec![container("busybox")]);
        if let Some(pod) = with_init.template.spec.as_mut() {
            pod.init_containers = Some(vec![container("init")]);
        }
        assert!(validate_job_spec("app", "spec.provision", &with_init).is_err());
    }

    #[test]
    fn pod_identity_is_rejected() {
        let mut named = job(vec![container("busybox")]);
        named.template.metadata = Some(ObjectMeta {
            name: Some("fixed".to_string()),
            ..Default::default()
        });
        let err = validate_job_spec("app", "spec.teardown", &named).unwrap_err();
        assert_eq!(field_of(err), "spec.teardown.template.metadata.name");
    }

    #[test]
    fn controller_owned_fields_are_rejected() {
        let mut spec = job(vec![container("busybox")]);
        spec.backoff_limit = Some(3);
        let err = validate_job_spec("app", "spec.provision", &spec).unwrap_err();
        assert_eq!(field_of(err), "spec.provision.backoffLimit");

        let mut spec = job(vec![container("busybox")]);
        spec.suspend = Some(false);
        assert!(validate_job_spec("app", "spec.provision", &spec).is_err());

        let mut spec = job(vec![container("busybox")]);
        spec.ttl_seconds_after_finished = Some(10);
        assert!(validate_job_spec("app", "spec.provision", &spec).is_err());
    }

    #[test]
    fn teardown_is_validated_when_present() {
        let spec = AppDeploymentSpec {
            provision: job(vec![container("busybox")]),
            teardown: Some(job(vec![])),
            op_id: "op".to_string(),
            dependencies: vec![],
        };
        let err = validate_app_deployment("app", &spec).unwrap_err();
        assert!(field_of(err).starts_with("spec.teardown"));
    }
}
