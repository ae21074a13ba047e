use metrics::{
    log_gauge,
    register_pilot_counter,
    register_pilot_gauge,
    register_pilot_histogram,
    StatusTimer,
    Timer,
};

register_pilot_histogram!(
    PG_GET_CONNECTION_SECONDS,
    "Time to acquire a pooled connection",
    metrics::STATUS_LABEL
);

pub(crate) fn get_connection_timer() -> StatusTimer {
    StatusTimer::new(&PG_GET_CONNECTION_SECONDS)
}

register_pilot_gauge!(PG_IDLE_CONNECTIONS, "Idle connections currently pooled");

pub(crate) fn connections_gauge(idle: f64) {
    log_gauge(&PG_IDLE_CONNECTIONS, idle);
}

register_pilot_histogram!(PG_QUERY_SECONDS, "Latency of adapter exec calls");

pub(crate) fn query_timer() -> Timer {
    Timer::new(&PG_QUERY_SECONDS)
}

register_pilot_counter!(PG_DDL_TOTAL, "DDL statements issued, by kind", &["kind"]);

pub(crate) fn log_ddl(kind: &str) {
    PG_DDL_TOTAL.with_label_values(&[kind]).inc();
}
