use common::types::{
    MutationAction,
    MutationId,
};
use metrics::{
    log_gauge,
    register_pilot_counter,
    register_pilot_gauge,
};

register_pilot_counter!(
    MUTATION_LOG_APPENDS_TOTAL,
    "Mutation records appended, by action",
    &["action"]
);
register_pilot_gauge!(MUTATION_LOG_LATEST_MID, "Highest allocated mutation id");

pub(crate) fn log_append(action: MutationAction) {
    MUTATION_LOG_APPENDS_TOTAL
        .with_label_values(&[&action.to_string()])
        .inc();
}

pub(crate) fn log_latest_mid(mid: MutationId) {
    log_gauge(&MUTATION_LOG_LATEST_MID, mid.0 as f64);
}
