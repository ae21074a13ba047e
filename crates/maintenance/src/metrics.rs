use metrics::{
    register_pilot_counter,
    register_pilot_histogram,
    Timer,
};

register_pilot_histogram!(MAINTENANCE_PASS_SECONDS, "Wall time of a maintenance pass");
register_pilot_counter!(
    MAINTENANCE_TASKS_TOTAL,
    "Maintenance subtask completions, by task and outcome",
    &["task", "outcome"]
);

pub(crate) fn log_maintenance_timer() -> Timer {
    Timer::new(&MAINTENANCE_PASS_SECONDS)
}

pub(crate) fn log_task_outcome(task: &str, ok: bool) {
    MAINTENANCE_TASKS_TOTAL
        .with_label_values(&[task, if ok { "ok" } else { "error" }])
        .inc();
}
