use metrics::{
    log_counter_with_label,
    register_pilot_counter,
};

register_pilot_counter!(BREAKER_OPENED_TOTAL, "Circuit breaker transitions to open");
register_pilot_counter!(
    GATE_DENIALS_TOTAL,
    "Gate denials by reason",
    &["reason"]
);

pub(crate) fn log_breaker_opened() {
    BREAKER_OPENED_TOTAL.inc();
}

pub(crate) fn log_gate_denial(reason: &str) {
    log_counter_with_label(&GATE_DENIALS_TOTAL, reason, 1);
}
