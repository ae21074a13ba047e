//! The decision engine pass: snapshot the workload, collect drafts, score
//! them, shape by read/write ratio, optimize under constraints, and prune
//! against the live index set. The pass only decides; the executor owns all
//! mutation-log writes and DDL.
use std::{
    collections::BTreeMap,
    sync::Arc,
};

use catalog::{
    Catalog,
    ExpressionProfile,
};
use chrono::{
    DateTime,
    Utc,
};
use common::{
    db::DbAdapter,
    knobs::{
        GLOBAL_STORAGE_BUDGET_BYTES,
        MAX_CANDIDATES_PER_TENANT,
        MAX_INDEXES_PER_TABLE,
        TENANT_STORAGE_BUDGET_BYTES,
    },
    types::{
        CatalogKey,
        ColumnType,
        IndexCandidate,
        LiveIndex,
        QueryFingerprint,
        TenantId,
    },
};
use planner::PlannerClient;
use query_stats::{
    QueryStatsStore,
    SnapshotFilter,
};

use crate::{
    candidates::{
        self,
        CollectionContext,
    },
    knapsack::{
        self,
        Constraints,
    },
    metrics::{
        log_candidates_emitted,
        log_candidates_rejected,
        log_pass_timer,
    },
    scorers::{
        Scorer,
        WorkloadContext,
    },
    scoring::{
        score_draft,
        ScoringInputs,
    },
    workload::{
        shaped_threshold,
        write_amplification_penalty,
    },
};

pub struct DecisionEngine {
    db: Arc<dyn DbAdapter>,
    planner: Arc<PlannerClient>,
    stats: Arc<QueryStatsStore>,
    catalog: Arc<Catalog>,
    profile: Arc<ExpressionProfile>,
    scorers: Vec<Box<dyn Scorer>>,
}

/// The engine's verdict for one tenant pass. Selected candidates are totally
/// ordered; rejected candidates carry the reason they were held back so the
/// executor can record them.
#[derive(Debug, Default)]
pub struct DecisionOutcome {
    pub selected: Vec<IndexCandidate>,
    pub rejected: Vec<(IndexCandidate, String)>,
    pub suppressed_spikes: Vec<(QueryFingerprint, u64)>,
}

impl DecisionEngine {
    pub fn new(
        db: Arc<dyn DbAdapter>,
        planner: Arc<PlannerClient>,
        stats: Arc<QueryStatsStore>,
        catalog: Arc<Catalog>,
        profile: Arc<ExpressionProfile>,
        scorers: Vec<Box<dyn Scorer>>,
    ) -> Self {
        Self {
            db,
            planner,
            stats,
            catalog,
            profile,
            scorers,
        }
    }

    pub async fn pass(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DecisionOutcome> {
        let _timer = log_pass_timer();
        let filter = SnapshotFilter {
            tenant: Some(tenant.clone()),
            ..Default::default()
        };
        let snapshot = self.stats.snapshot(&filter, now);
        if snapshot.is_empty() {
            // Empty workload: no candidates, no mutations.
            return Ok(DecisionOutcome::default());
        }

        let live = self.db.introspect_indexes(None).await?;
        let activity = self.stats.table_activity(Some(tenant));

        // Catalog entries visible to this tenant.
        let active_entries = self
            .profile
            .filter_active(tenant, self.catalog.entries());
        let active: BTreeMap<CatalogKey, ColumnType> = active_entries
            .iter()
            .map(|e| (e.key(), e.column_type.clone()))
            .collect();
        let foreign_keys: Vec<_> = self
            .catalog
            .foreign_keys()
            .into_iter()
            .filter(|e| self.profile.is_active(tenant, &e.key()))
            .collect();

        // Row counts and leading-column distinct estimates for every table
        // the snapshot touches.
        let mut rows = BTreeMap::new();
        let mut distinct = BTreeMap::new();
        for stat in &snapshot {
            let Some(table) = stat.refs.table.clone() else {
                continue;
            };
            if !rows.contains_key(&table) {
                rows.insert(table.clone(), self.db.table_rowcount(&table).await?);
            }
            for column in stat.refs.referenced_columns() {
                let key = CatalogKey {
                    table: table.clone(),
                    column: column.clone(),
                };
                if active.contains_key(&key) && !distinct.contains_key(&key) {
                    let estimate = self.db.distinct_estimate(&table, &column).await?;
                    distinct.insert(key, estimate);
                }
            }
        }

        let ctx = CollectionContext {
            tenant,
            active: &active,
            rows: &rows,
            distinct: &distinct,
            foreign_keys: &foreign_keys,
            live_indexes: &live,
        };
        let (drafts, spike_stats) = candidates::collect(&snapshot, &ctx);
        let suppressed_spikes = spike_stats
            .into_iter()
            .map(|s| (s.fingerprint, s.count))
            .collect();

        // Score, shape, and filter by the workload-adjusted threshold.
        let inputs = ScoringInputs {
            db: &*self.db,
            planner: &self.planner,
            scorers: &self.scorers,
        };
        let existing_per_table: BTreeMap<_, usize> =
            live.iter().filter(|ix| ix.valid).fold(BTreeMap::new(), |mut acc, ix| {
                *acc.entry(ix.table.clone()).or_default() += 1;
                acc
            });
        let mut scored = Vec::new();
        let mut rejected: Vec<(IndexCandidate, String)> = Vec::new();
        for draft in drafts {
            let table_activity = activity.get(&draft.table).copied().unwrap_or_default();
            let workload = WorkloadContext {
                rows: rows.get(&draft.table).copied().unwrap_or(0),
                activity: table_activity,
                existing_indexes: existing_per_table.get(&draft.table).copied().unwrap_or(0),
            };
            let column_types: Vec<ColumnType> = draft
                .columns
                .iter()
                .map(|c| {
                    active
                        .get(&CatalogKey {
                            table: draft.table.clone(),
                            column: c.clone(),
                        })
                        .cloned()
                        .unwrap_or(ColumnType::Other("unknown".to_owned()))
                })
                .collect();
            let mut candidate = score_draft(&inputs, draft, &column_types, &workload).await?;

            let penalty = write_amplification_penalty(&table_activity, workload.existing_indexes);
            candidate.score -= penalty;
            let threshold = shaped_threshold(&table_activity);
            if let Some(obj) = candidate.rationale.as_object_mut() {
                obj.insert("write_penalty".to_owned(), penalty.into());
                obj.insert("threshold".to_owned(), threshold.into());
            }
            if candidate.score <= threshold {
                rejected.push((candidate, "below-threshold".to_owned()));
            } else {
                scored.push(candidate);
            }
        }

        // A single-column candidate whose motivating fingerprints are all
        // carried by a wider candidate on the same table adds nothing on its
        // own; the wider index serves those queries.
        let mut subsumed = vec![false; scored.len()];
        for i in 0..scored.len() {
            for j in 0..scored.len() {
                if i == j || subsumed[j] {
                    continue;
                }
                let (a, b) = (&scored[i], &scored[j]);
                if a.table == b.table
                    && a.method == b.method
                    && a.predicate == b.predicate
                    && a.columns.len() < b.columns.len()
                    && a.columns.iter().all(|c| b.columns.contains(c))
                    && !a.motivating_fingerprints.is_empty()
                    && a.motivating_fingerprints
                        .iter()
                        .all(|fp| b.motivating_fingerprints.contains(fp))
                {
                    subsumed[i] = true;
                    break;
                }
            }
        }
        let mut remaining = Vec::new();
        for (candidate, is_subsumed) in scored.into_iter().zip(subsumed) {
            if is_subsumed {
                rejected.push((candidate, "subsumed-by-composite".to_owned()));
            } else {
                remaining.push(candidate);
            }
        }
        let scored = remaining;

        // Constraint optimization.
        let constraints = Constraints {
            tenant_budget_bytes: *TENANT_STORAGE_BUDGET_BYTES,
            global_budget_bytes: *GLOBAL_STORAGE_BUDGET_BYTES,
            tenant_used_bytes: 0,
            global_used_bytes: live.iter().map(|ix| ix.size_bytes).sum(),
            max_indexes_per_table: *MAX_INDEXES_PER_TABLE,
            max_candidates: *MAX_CANDIDATES_PER_TENANT,
        };
        let selection = knapsack::select(scored, &existing_per_table, &live, &constraints);
        rejected.extend(
            selection
                .rejected
                .into_iter()
                .map(|(c, reason)| (c, reason.to_owned())),
        );

        // Redundancy pruning against the live set.
        let mut selected = Vec::new();
        for mut candidate in selection.selected {
            let dominated_by_live = live.iter().any(|ix| {
                ix.valid
                    && ix.prefix_dominates(
                        &candidate.columns,
                        candidate.predicate.as_deref(),
                        candidate.method,
                    )
            });
            if dominated_by_live {
                rejected.push((candidate, "prefix-dominated".to_owned()));
                continue;
            }
            // The reverse direction pairs the dominated live index for a
            // post-commit drop.
            candidate.paired_drop = live
                .iter()
                .find(|ix| dominates_live(&candidate, ix))
                .map(|ix| ix.name.clone());
            selected.push(candidate);
        }

        log_candidates_emitted(selected.len());
        log_candidates_rejected(rejected.len());
        Ok(DecisionOutcome {
            selected,
            rejected,
            suppressed_spikes,
        })
    }
}

fn dominates_live(candidate: &IndexCandidate, live: &LiveIndex) -> bool {
    live.valid
        && live.table == candidate.table
        && live.method == candidate.method
        && live.predicate.as_deref() == candidate.predicate.as_deref()
        && candidate.columns.len() > live.columns.len()
        && candidate.columns[..live.columns.len()] == live.columns[..]
}
