//! The rollback plane: any recorded CREATE can be reversed, and committed
//! indexes whose motivating queries stopped improving are rolled back
//! automatically (or flagged, when auto-rollback is off).
use std::sync::Arc;

use common::{
    db::DbAdapter,
    knobs::{
        AUTO_ROLLBACK,
        IMPROVEMENT_THRESHOLD,
    },
    types::{
        MutationAction,
        MutationId,
        QueryFingerprint,
    },
};
use errors::ErrorMetadata;
use executor::LiveIndexCache;
use mutation_log::{
    MutationLog,
    NewMutation,
};
use planner::PlannerClient;
use serde_json::json;

pub struct RollbackPlane {
    db: Arc<dyn DbAdapter>,
    log: MutationLog,
    planner: Arc<PlannerClient>,
    live_cache: Arc<LiveIndexCache>,
}

impl RollbackPlane {
    pub fn new(
        db: Arc<dyn DbAdapter>,
        log: MutationLog,
        planner: Arc<PlannerClient>,
        live_cache: Arc<LiveIndexCache>,
    ) -> Self {
        Self {
            db,
            log,
            planner,
            live_cache,
        }
    }

    /// Reverse the mutation `mid`: find the CREATE (or the COMMIT whose
    /// chain leads to it), drop the index it built, and write a ROLLBACK
    /// record referencing `mid`.
    pub async fn rollback(&self, mid: MutationId) -> anyhow::Result<MutationId> {
        let record = self
            .log
            .get(mid)
            .ok_or_else(|| anyhow::anyhow!("mutation {mid} does not exist"))?;
        let index = match record.action {
            MutationAction::Create | MutationAction::Commit => {
                record.index.clone().ok_or_else(|| {
                    anyhow::anyhow!(ErrorMetadata::corrupted_metadata(
                        "create record lacks a target index",
                    ))
                })?
            },
            _ => anyhow::bail!(
                "mutation {mid} is {} and has no inverse action",
                record.action
            ),
        };

        let already_rolled_back = !self
            .log
            .scan(|r| r.action == MutationAction::Rollback && r.prev_mid == Some(mid))
            .is_empty();
        if already_rolled_back {
            anyhow::bail!("mutation {mid} was already rolled back");
        }

        let rollback_mid = self
            .log
            .append(NewMutation {
                tenant: record.tenant.clone(),
                action: MutationAction::Rollback,
                table: record.table.clone(),
                index: Some(index.clone()),
                details: json!({"rolled_back": mid.0}),
                prev_mid: Some(mid),
            })
            .await?;
        self.db.drop_index(&index).await?;
        self.live_cache.invalidate();
        Ok(rollback_mid)
    }

    /// Post-commit regression watch: for every committed index, re-EXPLAIN
    /// its motivating fingerprints. An index the planner no longer picks,
    /// with no cost improvement left, is rolled back when auto-rollback is
    /// on and flagged otherwise. Returns the indexes acted on.
    pub async fn regression_pass(&self) -> anyhow::Result<Vec<String>> {
        let commits = self.log.scan(|r| r.action == MutationAction::Commit);
        let mut acted = Vec::new();
        for commit in commits {
            let Some(index) = commit.index.clone() else {
                continue;
            };
            // Skip indexes that were already dropped or rolled back.
            let gone = !self
                .log
                .scan(|r| {
                    r.index.as_ref() == Some(&index)
                        && matches!(r.action, MutationAction::Drop | MutationAction::Rollback)
                        && r.id > commit.id
                })
                .is_empty();
            if gone {
                continue;
            }
            let Some(create) = commit.prev_mid.and_then(|m| self.log.get(m)) else {
                continue;
            };
            let fingerprints: Vec<QueryFingerprint> = create
                .details
                .get("fingerprints")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| QueryFingerprint::from_normalized(s.to_owned()))
                        .collect()
                })
                .unwrap_or_default();
            if fingerprints.is_empty() {
                continue;
            }
            let baseline = create
                .details
                .get("full_scan_cost")
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::MAX);

            let mut improved = false;
            for fp in &fingerprints {
                let (sql, params) = decision::scoring::fingerprint_to_sql(fp);
                if let Ok(plan) = self.planner.explain_fresh(fp, &sql, &params, false).await {
                    if plan.uses_index(&index)
                        || plan.total_cost() <= baseline * (1.0 - *IMPROVEMENT_THRESHOLD)
                    {
                        improved = true;
                        break;
                    }
                }
            }
            if improved {
                continue;
            }
            if *AUTO_ROLLBACK {
                let create_mid = create.id;
                self.rollback(create_mid).await?;
            } else {
                self.log
                    .append(NewMutation {
                        tenant: commit.tenant.clone(),
                        action: MutationAction::Propose,
                        table: commit.table.clone(),
                        index: Some(index.clone()),
                        details: json!({"reason": "regression-rollback-advised"}),
                        prev_mid: Some(commit.id),
                    })
                    .await?;
            }
            acted.push(index.to_string());
        }
        Ok(acted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        testing::FakeDb,
        types::{
            MutationAction,
            MutationId,
        },
    };
    use executor::LiveIndexCache;
    use mutation_log::{
        MutationLog,
        NewMutation,
    };
    use planner::PlannerClient;
    use serde_json::json;

    use super::RollbackPlane;

    async fn create_index_via_executor(
        db: &Arc<FakeDb>,
        log: &MutationLog,
    ) -> (RollbackPlane, MutationId) {
        use chrono::Utc;
        use common::types::{
            IndexCandidate,
            IndexMethod,
            QueryFingerprint,
            TenantId,
        };
        use decision::DecisionOutcome;
        use executor::{
            Executor,
            Mode,
        };
        use safeguards::Safeguards;

        db.add_table(&"contacts".parse().unwrap(), 100_000);
        let planner = Arc::new(PlannerClient::new(db.clone()));
        let safeguards = Arc::new(Safeguards::new(db.clone()).unwrap());
        let live_cache = Arc::new(LiveIndexCache::new(db.clone()));
        let executor = Executor::new(
            db.clone(),
            planner.clone(),
            log.clone(),
            safeguards,
            live_cache.clone(),
            Mode::Apply,
        );
        let candidate = IndexCandidate {
            tenant: TenantId::new("acme"),
            table: "contacts".parse().unwrap(),
            columns: vec!["tenant_id".parse().unwrap(), "email".parse().unwrap()],
            predicate: None,
            expression: None,
            method: IndexMethod::Ordered,
            build_cost: 1.0,
            benefit: 10.0,
            score: 9.0,
            size_estimate_bytes: 1 << 20,
            rationale: json!({"full_scan_cost": 100_000.0}),
            motivating_fingerprints: vec![QueryFingerprint::from_normalized(
                "select * from contacts where tenant_id = ? and email = ?".to_owned(),
            )],
            paired_drop: None,
        };
        executor
            .apply(
                &TenantId::new("acme"),
                DecisionOutcome {
                    selected: vec![candidate],
                    rejected: Vec::new(),
                    suppressed_spikes: Vec::new(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let create_mid = log
            .scan(|r| r.action == MutationAction::Create)
            .first()
            .unwrap()
            .id;
        let plane = RollbackPlane::new(db.clone(), log.clone(), planner, live_cache);
        (plane, create_mid)
    }

    #[tokio::test]
    async fn test_create_then_rollback_round_trip_from_pre_create_baseline() {
        let db = Arc::new(FakeDb::new());
        let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
        // True pre-create baseline: empty log, empty live set.
        assert_eq!(log.len(), 0);
        assert!(db.live_index_names().is_empty());

        let (plane, create_mid) = create_index_via_executor(&db, &log).await;
        assert_eq!(db.live_index_names().len(), 1);
        let actions: Vec<MutationAction> = log
            .tail_since(MutationId(0))
            .iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                MutationAction::Propose,
                MutationAction::Create,
                MutationAction::Commit,
            ]
        );

        plane.rollback(create_mid).await.unwrap();
        // The full round trip appends exactly four records: the create's
        // transition chain plus one rollback referencing the CREATE; the
        // live set is back to its pre-create state.
        assert!(db.live_index_names().is_empty());
        assert_eq!(log.len(), 4);
        let actions: Vec<MutationAction> = log
            .tail_since(MutationId(0))
            .iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                MutationAction::Propose,
                MutationAction::Create,
                MutationAction::Commit,
                MutationAction::Rollback,
            ]
        );
        let rollback = log.scan(|r| r.action == MutationAction::Rollback);
        assert_eq!(rollback.len(), 1);
        assert_eq!(rollback[0].prev_mid, Some(create_mid));

        // A second rollback of the same mutation is refused.
        assert!(plane.rollback(create_mid).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_of_non_create_is_refused() {
        let db = Arc::new(FakeDb::new());
        let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
        let mid = log
            .append(NewMutation {
                tenant: None,
                action: MutationAction::SpikeSuppressed,
                table: None,
                index: None,
                details: json!({}),
                prev_mid: None,
            })
            .await
            .unwrap();
        let planner = Arc::new(PlannerClient::new(db.clone()));
        let live_cache = Arc::new(LiveIndexCache::new(db.clone()));
        let plane = RollbackPlane::new(db.clone(), log, planner, live_cache);
        assert!(plane.rollback(mid).await.is_err());
    }

    #[tokio::test]
    async fn test_regression_pass_rolls_back_unused_committed_index() {
        let db = Arc::new(FakeDb::new());
        let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
        let (plane, _create_mid) = create_index_via_executor(&db, &log).await;
        assert_eq!(db.live_index_names().len(), 1);

        // The planner regresses to sequential scans after the commit.
        db.set_planner_uses_indexes(false);
        let acted = plane.regression_pass().await.unwrap();
        assert_eq!(acted.len(), 1);
        assert!(db.live_index_names().is_empty());

        // A second pass finds nothing left to do.
        let acted = plane.regression_pass().await.unwrap();
        assert!(acted.is_empty());
    }
}
