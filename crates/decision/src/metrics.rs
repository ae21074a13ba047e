use metrics::{
    register_pilot_counter,
    register_pilot_histogram,
    Timer,
};

register_pilot_histogram!(DECISION_PASS_SECONDS, "Wall time of a decision engine pass");
register_pilot_counter!(CANDIDATES_EMITTED_TOTAL, "Candidates emitted to the executor");
register_pilot_counter!(
    CANDIDATES_REJECTED_TOTAL,
    "Candidates scored but held back (threshold, budget, redundancy)"
);

pub(crate) fn log_pass_timer() -> Timer {
    Timer::new(&DECISION_PASS_SECONDS)
}

pub(crate) fn log_candidates_emitted(count: usize) {
    CANDIDATES_EMITTED_TOTAL.inc_by(count as u64);
}

pub(crate) fn log_candidates_rejected(count: usize) {
    CANDIDATES_REJECTED_TOTAL.inc_by(count as u64);
}
