//! Command line and environment configuration

use std::time::Duration;

use clap::Parser;

/// Operation cache controller - provisions, caches and hands out Operations
#[derive(Parser, Debug, Clone)]
#[command(name = "operation-cache-controller", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests as multi-document YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Server-side apply the CRDs at startup
    #[arg(
        long,
        env = "OPCACHE_INSTALL_CRDS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub install_crds: bool,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "OPCACHE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Max parallel AppDeployment reconciles
    #[arg(long, env = "OPCACHE_APPDEPLOYMENT_CONCURRENCY", default_value_t = 100)]
    pub appdeployment_concurrency: u16,

    /// Max parallel Operation reconciles
    #[arg(long, env = "OPCACHE_OPERATION_CONCURRENCY", default_value_t = 100)]
    pub operation_concurrency: u16,

    /// Max parallel Requirement reconciles
    #[arg(long, env = "OPCACHE_REQUIREMENT_CONCURRENCY", default_value_t = 100)]
    pub requirement_concurrency: u16,

    /// Max parallel Cache reconciles
    #[arg(long, env = "OPCACHE_CACHE_CONCURRENCY", default_value_t = 50)]
    pub cache_concurrency: u16,

    /// Warm Operations every Cache keeps
    #[arg(long, env = "OPCACHE_KEEP_ALIVE_COUNT", default_value_t = 5)]
    pub keep_alive_count: usize,

    /// Expiry, in seconds, given to Caches a Requirement creates or touches
    #[arg(long, env = "OPCACHE_CACHE_TTL_SECS", default_value_t = 7200)]
    pub cache_ttl_secs: i64,

    /// Cache resync interval in seconds
    #[arg(long, env = "OPCACHE_CACHE_RESYNC_SECS", default_value_t = 60)]
    pub cache_resync_secs: u64,

    /// Requirement requeue interval in seconds after a clean pass
    #[arg(long, env = "OPCACHE_REQUIREMENT_RESYNC_SECS", default_value_t = 600)]
    pub requirement_resync_secs: u64,
}

impl Cli {
    /// Cache expiry as a time delta
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs)
    }

    /// Cache resync interval
    pub fn cache_resync(&self) -> Duration {
        Duration::from_secs(self.cache_resync_secs)
    }

    /// Requirement resync interval
    pub fn requirement_resync(&self) -> Duration {
        Duration::from_secs(self.requirement_resync_secs)
    }
}
