//! Workload shaping: the score threshold tightens on write-heavy tables and
//! relaxes on read-heavy ones, and every existing index on a table adds a
//! write-amplification penalty.
use common::{
    knobs::{
        READ_HEAVY_THRESHOLD,
        SCORE_THRESHOLD,
        WRITE_HEAVY_THRESHOLD,
        WRITE_PENALTY,
    },
    types::TableActivity,
};

pub fn shaped_threshold(activity: &TableActivity) -> f64 {
    let r = activity.read_ratio();
    let multiplier = if r >= *READ_HEAVY_THRESHOLD {
        0.8
    } else if r <= *WRITE_HEAVY_THRESHOLD {
        1.5
    } else {
        1.0
    };
    *SCORE_THRESHOLD * multiplier
}

pub fn write_amplification_penalty(activity: &TableActivity, existing_indexes: usize) -> f64 {
    *WRITE_PENALTY * activity.writes as f64 * existing_indexes as f64
}
