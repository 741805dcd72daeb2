//! Content-addressed cache keys
//!
//! The cache key of an application set is a SHA-256 over the sorted
//! per-application SHA-256 digests. Each application digest covers its name,
//! the provision container's image, command, args, working directory, the
//! sorted `name=value` environment, and the sorted dependency list. Two sets
//! share a key iff they differ only in application, env var, or dependency
//! order.

use aws_lc_rs::digest::{Context, Digest, SHA256};
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::Container;

use crate::crd::ApplicationSpec;

/// Cache key of an application set, as lower-case hex
pub fn fingerprint(applications: &[ApplicationSpec]) -> String {
    let mut sorted: Vec<&ApplicationSpec> = applications.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut ctx = Context::new(&SHA256);
    for app in sorted {
        ctx.update(application_digest(app).as_bytes());
    }
    hex(ctx.finish())
}

/// Digest of one application, as lower-case hex.
///
/// Every field is length-prefixed and every list is count-prefixed, so
/// adjacent values cannot run into each other.
pub fn application_digest(app: &ApplicationSpec) -> String {
    let mut ctx = Context::new(&SHA256);
    write_field(&mut ctx, &app.name);

    match provision_container(&app.provision) {
        Some(container) => {
            ctx.update(&[1]);
            write_field(&mut ctx, container.image.as_deref().unwrap_or_default());
            write_list(&mut ctx, container.command.as_deref().unwrap_or_default());
            write_list(&mut ctx, container.args.as_deref().unwrap_or_default());
            write_field(&mut ctx, container.working_dir.as_deref().unwrap_or_default());

            let mut env: Vec<(&str, &str)> = container
                .env
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()))
                .collect();
            env.sort_unstable();
            write_len(&mut ctx, env.len());
            for (name, value) in env {
                write_field(&mut ctx, name);
                write_field(&mut ctx, value);
            }
        }
        None => ctx.update(&[0]),
    }

    let mut deps: Vec<&str> = app.dependencies.iter().map(String::as_str).collect();
    deps.sort_unstable();
    write_list(&mut ctx, &deps);

    hex(ctx.finish())
}

fn write_len(ctx: &mut Context, len: usize) {
    ctx.update(&(len as u64).to_be_bytes());
}

fn write_field(ctx: &mut Context, value: &str) {
    write_len(ctx, value.len());
    ctx.update(value.as_bytes());
}

fn write_list<S: AsRef<str>>(ctx: &mut Context, values: &[S]) {
    write_len(ctx, values.len());
    for value in values {
        write_field(ctx, value.as_ref());
    }
}

/// The single container of a job template, if present
fn provision_container(job: &JobSpec) -> Option<&Container> {
    job.template.spec.as_ref()?.containers.first()
}

fn hex(digest: Digest) -> String {
    digest
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
