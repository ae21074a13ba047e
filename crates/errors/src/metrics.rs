use metrics::{
    log_counter_with_label,
    register_pilot_counter,
};

use crate::ErrorMetadataAnyhowExt;

register_pilot_counter!(
    ERRORS_REPORTED_TOTAL,
    "Errors reported through report_error, labeled by short message",
    &["short_msg"]
);

/// Log an error through tracing and bump the per-tag counter. Transient and
/// resource errors log at WARN since the caller reschedules them; everything
/// else is an ERROR.
pub fn report_error(err: &anyhow::Error) {
    log_counter_with_label(&ERRORS_REPORTED_TOTAL, err.short_msg(), 1);
    if err.is_retryable() || err.is_deferrable() {
        tracing::warn!("{err:#}");
    } else {
        tracing::error!("{err:#}");
    }
}
