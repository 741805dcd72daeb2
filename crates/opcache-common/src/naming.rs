//! Object naming rules
//!
//! Every derived name must fit the 63-character DNS label limit and must not
//! end in a hyphen after truncation.

use rand::Rng;

/// Maximum length of a DNS label (object names, label values)
pub const MAX_NAME_LEN: usize = 63;

/// Application names are trimmed to this length inside AppDeployment names
pub const MAX_APP_NAME_LEN: usize = 36;

/// Length of the random suffix on warm Operation names
const WARM_SUFFIX_LEN: usize = 5;

/// Cache key characters kept in a warm Operation name
const WARM_KEY_PREFIX_LEN: usize = 8;

/// Truncate to `max` characters and drop trailing hyphens
pub fn truncate(name: &str, max: usize) -> String {
    let truncated: String = name.chars().take(max).collect();
    truncated.trim_end_matches('-').to_string()
}

/// AppDeployment name for `app_name` inside the Operation `op_id`.
///
/// The application name keeps up to 36 characters; the operation id gets
/// whatever is left of the 63-character budget.
pub fn app_deployment_name(op_id: &str, app_name: &str) -> String {
    let app = truncate(app_name, MAX_APP_NAME_LEN);
    let residual = MAX_NAME_LEN.saturating_sub(app.chars().count() + 1);
    let op = truncate(op_id, residual);
    format!("{op}-{app}")
}

/// Name of the provision Job of an AppDeployment
pub fn provision_job_name(app_deployment: &str) -> String {
    truncate(&format!("provision-{app_deployment}"), MAX_NAME_LEN)
}

/// Name of the teardown Job of an AppDeployment
pub fn teardown_job_name(app_deployment: &str) -> String {
    truncate(&format!("teardown-{app_deployment}"), MAX_NAME_LEN)
}

/// Name of the Cache holding warm Operations for `cache_key`
pub fn cache_name(cache_key: &str) -> String {
    truncate(&format!("cache-{cache_key}"), MAX_NAME_LEN)
}

/// Name of the Operation a Requirement creates on a cache miss
pub fn requirement_operation_name(requirement: &str) -> String {
    format!("{requirement}-operation")
}

/// Cache key as a label value
pub fn cache_key_label_value(cache_key: &str) -> String {
    truncate(cache_key, MAX_NAME_LEN)
}

/// Warm Operation name with a fixed suffix
pub fn warm_operation_name_with_suffix(cache_key: &str, suffix: &str) -> String {
    let prefix: String = cache_key.chars().take(WARM_KEY_PREFIX_LEN).collect();
    format!("cached-operation-{prefix}-{suffix}")
}

/// Warm Operation name with a fresh random suffix
pub fn warm_operation_name(cache_key: &str) -> String {
    warm_operation_name_with_suffix(cache_key, &random_suffix(&mut rand::thread_rng()))
}

/// Five random lowercase ASCII letters
pub fn random_suffix(rng: &mut impl Rng) -> String {
    (0..WARM_SUFFIX_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}
