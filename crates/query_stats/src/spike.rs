//! Spike-versus-sustained classification. Only sustained fingerprints may
//! motivate index candidates; a burst that shows up in one bucket and
//! vanishes must not leave a permanent index behind.
use std::collections::BTreeMap;

use common::knobs::{
    SPIKE_BUCKETS_REQUIRED,
    SPIKE_BUCKET_WINDOW,
    SPIKE_MULTIPLIER,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Sustained,
    Spike,
}

/// Per-bucket observation counts, keyed by bucket index (time / bucket
/// width). Old buckets are pruned by the store.
#[derive(Clone, Debug, Default)]
pub struct BucketHistory {
    counts: BTreeMap<u64, u64>,
}

impl BucketHistory {
    pub fn observe(&mut self, bucket: u64) {
        *self.counts.entry(bucket).or_default() += 1;
        self.prune(bucket);
    }

    fn prune(&mut self, current: u64) {
        let window = *SPIKE_BUCKET_WINDOW as u64;
        let cutoff = current.saturating_sub(window.saturating_sub(1));
        self.counts.retain(|&bucket, _| bucket >= cutoff);
    }

    /// Sustained iff the fingerprint appeared in at least K of the last N
    /// buckets and the current bucket is not a blow-up over the historical
    /// median.
    pub fn classify(&self, current: u64) -> Classification {
        let window = *SPIKE_BUCKET_WINDOW as u64;
        let cutoff = current.saturating_sub(window.saturating_sub(1));
        let in_window: Vec<(u64, u64)> = self
            .counts
            .range(cutoff..=current)
            .map(|(&b, &c)| (b, c))
            .collect();

        if in_window.len() < *SPIKE_BUCKETS_REQUIRED {
            return Classification::Spike;
        }

        let mut historical: Vec<u64> = in_window
            .iter()
            .filter(|(b, _)| *b != current)
            .map(|(_, c)| *c)
            .collect();
        if historical.is_empty() {
            return Classification::Spike;
        }
        historical.sort_unstable();
        let median = historical[historical.len() / 2] as f64;
        let current_count = self.counts.get(&current).copied().unwrap_or(0) as f64;
        if median > 0.0 && current_count > *SPIKE_MULTIPLIER * median {
            return Classification::Spike;
        }
        Classification::Sustained
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}
