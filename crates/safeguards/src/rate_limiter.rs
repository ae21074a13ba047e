//! Token buckets for the three heavy actions. Capacity adapts: a retarget
//! pass rebuilds each bucket's quota to the 95th percentile of recent hourly
//! usage, floored at the configured baseline.
use std::num::NonZeroU32;

use common::knobs::{
    RATE_ANALYZE_PER_HOUR,
    RATE_INDEX_CREATES_PER_HOUR,
    RATE_REINDEX_PER_HOUR,
};
use governor::{
    clock::DefaultClock,
    state::{
        InMemoryState,
        NotKeyed,
    },
    Quota,
    RateLimiter,
};
use parking_lot::{
    Mutex,
    RwLock,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Action {
    IndexCreation,
    Reindex,
    Analyze,
}

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct ActionBucket {
    limiter: RwLock<Bucket>,
    baseline_per_hour: u32,
    // Completed-hour usage counts, newest last.
    usage_history: Mutex<Vec<u32>>,
    current_hour_usage: Mutex<u32>,
}

const USAGE_HISTORY_HOURS: usize = 24;

fn hourly_quota(per_hour: u32) -> Quota {
    let per_hour = NonZeroU32::new(per_hour.max(1)).expect("clamped to >= 1");
    Quota::per_hour(per_hour).allow_burst(per_hour)
}

impl ActionBucket {
    fn new(baseline_per_hour: u32) -> Self {
        Self {
            limiter: RwLock::new(RateLimiter::direct(hourly_quota(baseline_per_hour))),
            baseline_per_hour,
            usage_history: Mutex::new(Vec::new()),
            current_hour_usage: Mutex::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        let allowed = self.limiter.read().check().is_ok();
        if allowed {
            *self.current_hour_usage.lock() += 1;
        }
        allowed
    }

    /// Close out the current usage hour and retune capacity to the p95 of
    /// recent hours.
    fn retarget(&self) {
        let used = std::mem::take(&mut *self.current_hour_usage.lock());
        let target = {
            let mut history = self.usage_history.lock();
            history.push(used);
            if history.len() > USAGE_HISTORY_HOURS {
                history.remove(0);
            }
            let mut sorted = history.clone();
            sorted.sort_unstable();
            let p95_index = (sorted.len() * 95).div_ceil(100).saturating_sub(1);
            sorted.get(p95_index).copied().unwrap_or(0)
        };
        let capacity = target.max(self.baseline_per_hour);
        *self.limiter.write() = RateLimiter::direct(hourly_quota(capacity));
    }
}

pub struct ActionRateLimiter {
    creates: ActionBucket,
    reindex: ActionBucket,
    analyze: ActionBucket,
}

impl ActionRateLimiter {
    pub fn new() -> Self {
        Self {
            creates: ActionBucket::new(*RATE_INDEX_CREATES_PER_HOUR),
            reindex: ActionBucket::new(*RATE_REINDEX_PER_HOUR),
            analyze: ActionBucket::new(*RATE_ANALYZE_PER_HOUR),
        }
    }

    fn bucket(&self, action: Action) -> &ActionBucket {
        match action {
            Action::IndexCreation => &self.creates,
            Action::Reindex => &self.reindex,
            Action::Analyze => &self.analyze,
        }
    }

    /// Take one token; `false` means the action is deferred to a later pass.
    pub fn try_acquire(&self, action: Action) -> bool {
        self.bucket(action).try_acquire()
    }

    /// Hourly retune, driven by the scheduler.
    pub fn retarget(&self) {
        self.creates.retarget();
        self.reindex.retarget();
        self.analyze.retarget();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Action,
        ActionRateLimiter,
    };

    #[test]
    fn test_bucket_exhausts_and_defers() {
        let limiter = ActionRateLimiter::new();
        let capacity = *common::knobs::RATE_INDEX_CREATES_PER_HOUR;
        for _ in 0..capacity {
            assert!(limiter.try_acquire(Action::IndexCreation));
        }
        assert!(!limiter.try_acquire(Action::IndexCreation));
        // Other buckets are unaffected.
        assert!(limiter.try_acquire(Action::Analyze));
    }

    #[test]
    fn test_retarget_never_drops_below_baseline() {
        let limiter = ActionRateLimiter::new();
        // A day of zero usage still leaves the baseline capacity.
        for _ in 0..30 {
            limiter.retarget();
        }
        assert!(limiter.try_acquire(Action::Reindex));
    }
}
