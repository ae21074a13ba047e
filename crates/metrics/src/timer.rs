use std::time::{
    Duration,
    Instant,
};

use prometheus::{
    Histogram,
    HistogramVec,
};

pub const STATUS_LABEL: &[&str] = &["status"];

/// Observes elapsed seconds into a histogram when dropped.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Like [`Timer`], but records a `status` label: `success` when the caller
/// reaches `finish()`, `error` when the timer is dropped without it.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    finished: bool,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            finished: false,
        }
    }

    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let elapsed = self.start.elapsed();
        self.histogram
            .with_label_values(&["success"])
            .observe(elapsed.as_secs_f64());
        elapsed
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if self.finished || std::thread::panicking() {
            return;
        }
        self.histogram
            .with_label_values(&["error"])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
