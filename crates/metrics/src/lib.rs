//! Prometheus facade for IndexPilot.
//!
//! Every crate registers its metrics through the `register_pilot_*` macros,
//! which prefix the metric name and pin it to the process-wide registry.
//! Metric definitions live in a `metrics.rs` module per crate, with small
//! `log_*` helpers so call sites never touch prometheus types directly.
use std::sync::LazyLock;

use prometheus::Registry;

mod macros;
mod reporting;
mod timer;

// Re-exported for use inside the registration macros.
pub use paste::paste;
pub use prometheus;

pub use crate::{
    reporting::{
        log_counter,
        log_counter_with_label,
        log_distribution,
        log_gauge,
        log_gauge_with_label,
    },
    timer::{
        StatusTimer,
        Timer,
        STATUS_LABEL,
    },
};

/// The process-wide metric registry. The daemon's read API serves a dump of
/// this registry; tests can scrape it directly.
pub static PILOT_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Gather all registered metric families, e.g. for text exposition.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    PILOT_METRICS_REGISTRY.gather()
}

/// Buckets suitable for operation latencies in seconds, from 1ms to ~100s.
pub fn latency_buckets() -> Vec<f64> {
    prometheus::exponential_buckets(0.001, 2.0, 17).expect("static bucket config")
}

#[cfg(test)]
mod tests {
    use crate::{
        log_counter,
        register_pilot_counter,
    };

    register_pilot_counter!(METRICS_SELF_TEST_TOTAL, "Counter used by the facade's own test");

    #[test]
    fn test_register_and_gather() {
        log_counter(&METRICS_SELF_TEST_TOTAL, 3);
        let families = crate::gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "indexpilot_metrics_self_test_total")
            .expect("registered metric is gatherable");
        assert_eq!(family.get_metric()[0].get_counter().get_value() as u64, 3);
    }
}
