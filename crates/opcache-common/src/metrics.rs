//! Metrics for the operation cache controllers
//!
//! Instruments are created lazily on the global meter, so they are no-ops
//! until telemetry installs an OTLP meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("operation-cache-controller"));

/// Counter of finished reconciliations
///
/// Labels:
/// - `controller`: appdeployment, operation, cache, requirement
/// - `result`: success, error
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("opcache_reconcile_total")
        .with_description("Total number of reconciliations")
        .with_unit("{reconciliations}")
        .build()
});

/// Histogram of reconciliation duration
///
/// Labels:
/// - `controller`: appdeployment, operation, cache, requirement
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("opcache_reconcile_duration_seconds")
        .with_description("Duration of reconciliations in seconds")
        .with_unit("s")
        .build()
});

/// Counter of warm pool lookups by Requirements
///
/// Labels:
/// - `result`: hit, miss
pub static CACHE_LOOKUPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("opcache_cache_lookups_total")
        .with_description("Total number of warm pool lookups")
        .with_unit("{lookups}")
        .build()
});

/// Gauge of Reconciled warm Operations per Cache
///
/// Labels:
/// - `cache`: Cache name
pub static CACHE_AVAILABLE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("opcache_cache_available")
        .with_description("Number of Reconciled warm Operations in a Cache")
        .with_unit("{operations}")
        .build()
});

/// Counter of warm Operations created by Caches
pub static WARM_OPERATIONS_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("opcache_warm_operations_created_total")
        .with_description("Total number of warm Operations created")
        .with_unit("{operations}")
        .build()
});

/// Counter of warm Operations deleted by Caches
pub static WARM_OPERATIONS_DELETED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("opcache_warm_operations_deleted_total")
        .with_description("Total number of warm Operations deleted")
        .with_unit("{operations}")
        .build()
});

/// Outcome of a warm pool lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// A warm Operation was adopted
    Hit,
    /// The Requirement falls back to its own Operation
    Miss,
}

impl CacheLookup {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// Record a warm pool lookup
pub fn record_cache_lookup(result: CacheLookup) {
    CACHE_LOOKUPS.add(1, &[KeyValue::new("result", result.as_str())]);
}

/// Publish the number of Reconciled warm Operations of a Cache
pub fn record_cache_available(cache: &str, available: usize) {
    CACHE_AVAILABLE.record(
        i64::try_from(available).unwrap_or(i64::MAX),
        &[KeyValue::new("cache", cache.to_string())],
    );
}

/// Record warm pool changes made by one Cache pass
pub fn record_warm_pool_change(created: usize, deleted: usize) {
    if created > 0 {
        WARM_OPERATIONS_CREATED.add(created as u64, &[]);
    }
    if deleted > 0 {
        WARM_OPERATIONS_DELETED.add(deleted as u64, &[]);
    }
}

/// Times one reconciliation
pub struct ReconcileTimer {
    controller: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation of `controller`
    pub fn start(controller: &'static str) -> Self {
        Self {
            controller,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        self.finish("success");
    }

    /// Record error completion
    pub fn error(self) {
        self.finish("error");
    }

    fn finish(self, result: &'static str) {
        let labels = [
            KeyValue::new("controller", self.controller),
            KeyValue::new("result", result),
        ];
        RECONCILE_DURATION.record(self.start.elapsed().as_secs_f64(), &labels);
        RECONCILE_TOTAL.add(1, &labels);
    }
}
