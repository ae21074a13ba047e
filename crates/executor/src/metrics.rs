use metrics::{
    register_pilot_counter,
    register_pilot_histogram,
    Timer,
};

use crate::BuildState;

register_pilot_histogram!(INDEX_BUILD_SECONDS, "Wall time of index builds, retries included");
register_pilot_counter!(
    BUILD_OUTCOMES_TOTAL,
    "Candidate outcomes by terminal state",
    &["state"]
);

pub(crate) fn log_build_timer() -> Timer {
    Timer::new(&INDEX_BUILD_SECONDS)
}

pub(crate) fn log_build_outcome(state: BuildState) {
    let label = match state {
        BuildState::Proposed => "proposed",
        BuildState::Deferred => "deferred",
        BuildState::FailedInvalid => "failed_invalid",
        BuildState::Committed => "committed",
        BuildState::RolledBack => "rolled_back",
    };
    BUILD_OUTCOMES_TOTAL.with_label_values(&[label]).inc();
}
