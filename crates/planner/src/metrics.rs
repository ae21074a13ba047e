use metrics::register_pilot_counter;

register_pilot_counter!(PLANNER_CACHE_HITS_TOTAL, "EXPLAIN cache hits");
register_pilot_counter!(PLANNER_CACHE_MISSES_TOTAL, "EXPLAIN cache misses");
register_pilot_counter!(PLANNER_FAILURES_TOTAL, "EXPLAIN calls that failed");
register_pilot_counter!(
    PLANNER_UNRELIABLE_MARKED_TOTAL,
    "Fingerprints marked planner-unreliable"
);

pub(crate) fn log_cache_hit() {
    PLANNER_CACHE_HITS_TOTAL.inc();
}

pub(crate) fn log_cache_miss() {
    PLANNER_CACHE_MISSES_TOTAL.inc();
}

pub(crate) fn log_planner_failure() {
    PLANNER_FAILURES_TOTAL.inc();
}

pub(crate) fn log_unreliable_marked() {
    PLANNER_UNRELIABLE_MARKED_TOTAL.inc();
}
