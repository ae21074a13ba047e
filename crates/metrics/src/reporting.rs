use prometheus::{
    Gauge,
    GaugeVec,
    Histogram,
    IntCounter,
    IntCounterVec,
};

pub fn log_counter(counter: &IntCounter, increment: u64) {
    counter.inc_by(increment);
}

pub fn log_counter_with_label(counter: &IntCounterVec, label: &str, increment: u64) {
    counter.with_label_values(&[label]).inc_by(increment);
}

pub fn log_gauge(gauge: &Gauge, value: f64) {
    gauge.set(value);
}

pub fn log_gauge_with_label(gauge: &GaugeVec, label: &str, value: f64) {
    gauge.with_label_values(&[label]).set(value);
}

pub fn log_distribution(histogram: &Histogram, value: f64) {
    histogram.observe(value);
}
