use metrics::{
    log_gauge,
    register_pilot_counter,
    register_pilot_gauge,
};

register_pilot_counter!(INGEST_OBSERVATIONS_TOTAL, "Query observations ingested");
register_pilot_counter!(
    INGEST_DROPPED_TOTAL,
    "Observations dropped because the ingest buffer was full"
);
register_pilot_gauge!(FINGERPRINTS_TRACKED, "Distinct (tenant, fingerprint) aggregates");

pub(crate) fn log_ingested() {
    INGEST_OBSERVATIONS_TOTAL.inc();
}

pub(crate) fn log_ingest_dropped() {
    INGEST_DROPPED_TOTAL.inc();
}

pub(crate) fn log_fingerprints_tracked(count: usize) {
    log_gauge(&FINGERPRINTS_TRACKED, count as f64);
}
