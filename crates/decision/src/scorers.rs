//! Pluggable advisory scorers. Each one is a pure function from a draft and
//! its workload context to a (recommendation, confidence) pair; the engine
//! turns that into an additive score adjustment bounded by `scorer_weight`.
//! None of them is load-bearing; the engine runs fine with an empty set.
use common::{
    knobs::SCORER_WEIGHT,
    types::{
        IndexMethod,
        TableActivity,
    },
};

use crate::candidates::CandidateDraft;

pub struct WorkloadContext {
    pub rows: u64,
    pub activity: TableActivity,
    pub existing_indexes: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct ScorerVerdict {
    /// Direction and strength, in [-1, 1].
    pub recommendation: f64,
    /// How much the scorer trusts itself, in [0, 1].
    pub confidence: f64,
}

impl ScorerVerdict {
    pub fn neutral() -> Self {
        Self {
            recommendation: 0.0,
            confidence: 0.0,
        }
    }

    /// The bounded additive adjustment this verdict contributes.
    pub fn adjustment(&self) -> f64 {
        (self.recommendation.clamp(-1.0, 1.0) * self.confidence.clamp(0.0, 1.0)) * *SCORER_WEIGHT
    }
}

pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, draft: &CandidateDraft, workload: &WorkloadContext) -> ScorerVerdict;
}

/// Rewards composite candidates whose columns co-occur strongly; a composite
/// index on weakly-correlated filters mostly burns write throughput.
pub struct CorrelationScorer;

impl Scorer for CorrelationScorer {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn score(&self, draft: &CandidateDraft, _workload: &WorkloadContext) -> ScorerVerdict {
        let Some(strength) = draft.corr_strength else {
            return ScorerVerdict::neutral();
        };
        ScorerVerdict {
            // Map [corr_threshold, 1.0] onto a positive recommendation.
            recommendation: (strength - 0.5).clamp(-1.0, 1.0),
            confidence: (draft.columns.len() as f64 / 4.0).min(1.0),
        }
    }
}

/// Advises in favor of block-range indexes on very large, write-heavy
/// tables, where an ordered index's maintenance cost dominates its benefit.
pub struct BrinAdvisor;

impl Scorer for BrinAdvisor {
    fn name(&self) -> &'static str {
        "brin_advisor"
    }

    fn score(&self, draft: &CandidateDraft, workload: &WorkloadContext) -> ScorerVerdict {
        if workload.rows < 1_000_000 {
            return ScorerVerdict::neutral();
        }
        let write_ratio = 1.0 - workload.activity.read_ratio();
        match draft.method {
            IndexMethod::Brin => ScorerVerdict {
                recommendation: 0.8,
                confidence: write_ratio,
            },
            IndexMethod::Ordered => ScorerVerdict {
                recommendation: -0.3,
                confidence: write_ratio * (workload.rows as f64 / 1e8).min(1.0),
            },
            _ => ScorerVerdict::neutral(),
        }
    }
}

pub fn default_scorers() -> Vec<Box<dyn Scorer>> {
    vec![Box::new(CorrelationScorer), Box::new(BrinAdvisor)]
}

#[cfg(test)]
mod tests {
    use common::types::{
        IndexMethod,
        TableActivity,
        TenantId,
    };

    use super::{
        BrinAdvisor,
        CorrelationScorer,
        Scorer,
        ScorerVerdict,
        WorkloadContext,
    };
    use crate::candidates::{
        CandidateDraft,
        CandidateSource,
    };

    fn draft(method: IndexMethod, corr: Option<f64>) -> CandidateDraft {
        CandidateDraft {
            tenant: TenantId::new("acme"),
            table: "events".parse().unwrap(),
            columns: vec!["ts".parse().unwrap(), "kind".parse().unwrap()],
            method,
            source: CandidateSource::Composite,
            motivating: Vec::new(),
            freq: 100,
            corr_strength: corr,
        }
    }

    fn workload(rows: u64, reads: u64, writes: u64) -> WorkloadContext {
        WorkloadContext {
            rows,
            activity: TableActivity { reads, writes },
            existing_indexes: 0,
        }
    }

    #[test]
    fn test_adjustments_are_bounded() {
        let verdict = ScorerVerdict {
            recommendation: 100.0,
            confidence: 100.0,
        };
        assert!(verdict.adjustment() <= *common::knobs::SCORER_WEIGHT);
    }

    #[test]
    fn test_correlation_scorer_rewards_strong_cooccurrence() {
        let scorer = CorrelationScorer;
        let strong = scorer.score(&draft(IndexMethod::Ordered, Some(0.9)), &workload(1000, 1, 1));
        let none = scorer.score(&draft(IndexMethod::Ordered, None), &workload(1000, 1, 1));
        assert!(strong.adjustment() > 0.0);
        assert_eq!(none.adjustment(), 0.0);
    }

    #[test]
    fn test_brin_advisor_prefers_brin_on_write_heavy_giants() {
        let scorer = BrinAdvisor;
        let giant = workload(50_000_000, 100, 900);
        let brin = scorer.score(&draft(IndexMethod::Brin, None), &giant);
        let ordered = scorer.score(&draft(IndexMethod::Ordered, None), &giant);
        assert!(brin.adjustment() > 0.0);
        assert!(ordered.adjustment() < 0.0);
        // Small tables get no opinion.
        let small = scorer.score(&draft(IndexMethod::Brin, None), &workload(10_000, 1, 1));
        assert_eq!(small.adjustment(), 0.0);
    }
}
