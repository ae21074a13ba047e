use std::sync::Arc;

use chrono::Utc;
use common::{
    testing::{
        FakeDb,
        ScriptedDdl,
    },
    db::DdlOutcome,
    types::{
        IndexCandidate,
        IndexMethod,
        LiveIndex,
        MutationAction,
        MutationId,
        QueryFingerprint,
        TenantId,
    },
};
use decision::DecisionOutcome;
use mutation_log::MutationLog;
use planner::PlannerClient;
use safeguards::Safeguards;
use serde_json::json;

use crate::{
    BuildState,
    Executor,
    LiveIndexCache,
    Mode,
};

fn candidate(columns: &[&str]) -> IndexCandidate {
    IndexCandidate {
        tenant: TenantId::new("acme"),
        table: "contacts".parse().unwrap(),
        columns: columns.iter().map(|c| c.parse().unwrap()).collect(),
        predicate: None,
        expression: None,
        method: IndexMethod::Ordered,
        build_cost: 1000.0,
        benefit: 100_000.0,
        score: 99_000.0,
        size_estimate_bytes: 5 << 20,
        rationale: json!({"full_scan_cost": 100_000.0}),
        motivating_fingerprints: vec![QueryFingerprint::from_normalized(
            "select * from contacts where tenant_id = ? and email = ?".to_owned(),
        )],
        paired_drop: None,
    }
}

fn outcome_with(selected: Vec<IndexCandidate>) -> DecisionOutcome {
    DecisionOutcome {
        selected,
        rejected: Vec::new(),
        suppressed_spikes: Vec::new(),
    }
}

async fn executor_fixture(db: Arc<FakeDb>, mode: Mode) -> (Executor, MutationLog) {
    db.add_table(&"contacts".parse().unwrap(), 100_000);
    let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
    let planner = Arc::new(PlannerClient::new(db.clone()));
    let safeguards = Arc::new(Safeguards::new(db.clone()).unwrap());
    let live_cache = Arc::new(LiveIndexCache::new(db.clone()));
    let executor = Executor::new(db, planner, log.clone(), safeguards, live_cache, mode);
    (executor, log)
}

#[tokio::test]
async fn test_happy_path_writes_propose_create_commit_in_order() {
    let db = Arc::new(FakeDb::new());
    let (executor, log) = executor_fixture(db.clone(), Mode::Apply).await;

    let results = executor
        .apply(
            &TenantId::new("acme"),
            outcome_with(vec![candidate(&["tenant_id", "email"])]),
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].state, BuildState::Committed);
    let name = results[0].index_name.clone().unwrap();
    assert_eq!(&*name, "ix_contacts_tenant_id_email");

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
    assert!(db.live_index_names().contains(&name));
}

#[tokio::test]
async fn test_advisory_mode_records_proposal_without_ddl() {
    let db = Arc::new(FakeDb::new());
    let (executor, log) = executor_fixture(db.clone(), Mode::Advisory).await;

    let results = executor
        .apply(
            &TenantId::new("acme"),
            outcome_with(vec![candidate(&["tenant_id", "email"])]),
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(results[0].state, BuildState::Proposed);
    assert!(db.ddl_log().is_empty());
    let records = log.tail_since(MutationId(0));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, MutationAction::Propose);
}

#[tokio::test]
async fn test_validation_regression_rolls_back_and_restores_live_set() {
    let db = Arc::new(FakeDb::new());
    // The planner keeps sequential-scanning even after the build.
    db.set_planner_uses_indexes(false);
    let (executor, log) = executor_fixture(db.clone(), Mode::Apply).await;

    let results = executor
        .apply(
            &TenantId::new("acme"),
            outcome_with(vec![candidate(&["tenant_id", "email"])]),
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(results[0].state, BuildState::RolledBack);
    // COMMITTED is never reached; the log shows CREATE then DROP on the
    // same target.
    let records = log.tail_since(MutationId(0));
    let actions: Vec<MutationAction> = records.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![
            MutationAction::Propose,
            MutationAction::Create,
            MutationAction::Drop,
        ]
    );
    assert_eq!(records[1].index, records[2].index);
    // The pre-mutation live set is restored.
    assert!(db.live_index_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_consecutive_lock_timeouts() {
    let db = Arc::new(FakeDb::new());
    let attempts = *common::knobs::BUILD_MAX_ATTEMPTS as usize;
    let threshold = *common::knobs::BREAKER_FAILURE_THRESHOLD as usize;
    for _ in 0..attempts * threshold {
        db.push_ddl_script(ScriptedDdl::Outcome(DdlOutcome::LockTimeout));
    }
    let (executor, log) = executor_fixture(db.clone(), Mode::Apply).await;
    let tenant = TenantId::new("acme");

    for i in 0..threshold {
        let results = executor
            .apply(
                &tenant,
                outcome_with(vec![candidate(&[format!("c{i}").leak()])]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(results[0].state, BuildState::Deferred);
        assert_eq!(results[0].reason.as_deref(), Some("lock-timeout"));
    }
    let ddl_before = db.ddl_log().len();
    assert_eq!(ddl_before, attempts * threshold);

    // The next CREATE on the table is rejected at the gate, before any
    // adapter work.
    let results = executor
        .apply(
            &tenant,
            outcome_with(vec![candidate(&["another"])]),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(results[0].state, BuildState::Deferred);
    assert_eq!(results[0].reason.as_deref(), Some("circuit-open"));
    assert_eq!(db.ddl_log().len(), ddl_before);

    let deferred_records = log.scan(|r| {
        r.action == MutationAction::Deferred
            && r.details.get("reason").and_then(|v| v.as_str()) == Some("circuit-open")
    });
    assert_eq!(deferred_records.len(), 1);
}

#[tokio::test]
async fn test_failed_invalid_build_is_recorded_for_cleanup() {
    let db = Arc::new(FakeDb::new());
    db.push_ddl_script(ScriptedDdl::Outcome(DdlOutcome::FailedInvalid));
    let (executor, log) = executor_fixture(db.clone(), Mode::Apply).await;

    let results = executor
        .apply(
            &TenantId::new("acme"),
            outcome_with(vec![candidate(&["tenant_id", "email"])]),
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(results[0].state, BuildState::FailedInvalid);
    assert!(!log
        .scan(|r| r.action == MutationAction::CreateFailed)
        .is_empty());
    // The invalid object is still present; the integrity sweep owns the
    // cleanup.
    assert_eq!(db.live_index_names().len(), 1);
}

#[tokio::test]
async fn test_paired_drop_runs_only_after_commit() {
    let db = Arc::new(FakeDb::new());
    db.add_live_index(LiveIndex {
        name: "ix_contacts_tenant_id".parse().unwrap(),
        table: "contacts".parse().unwrap(),
        columns: vec!["tenant_id".parse().unwrap()],
        predicate: None,
        method: IndexMethod::Ordered,
        size_bytes: 1 << 20,
        scan_count: 5,
        last_used: None,
        bloat_fraction: 0.0,
        valid: true,
        created_by: None,
    });
    let (executor, log) = executor_fixture(db.clone(), Mode::Apply).await;

    let mut c = candidate(&["tenant_id", "email"]);
    c.paired_drop = Some("ix_contacts_tenant_id".parse().unwrap());
    let results = executor
        .apply(&TenantId::new("acme"), outcome_with(vec![c]), Utc::now())
        .await
        .unwrap();

    assert_eq!(results[0].state, BuildState::Committed);
    let names = db.live_index_names();
    assert!(names.iter().any(|n| &**n == "ix_contacts_tenant_id_email"));
    assert!(!names.iter().any(|n| &**n == "ix_contacts_tenant_id"));

    // The drop record references the commit that superseded it.
    let records = log.tail_since(MutationId(0));
    let commit = records
        .iter()
        .find(|r| r.action == MutationAction::Commit)
        .unwrap();
    let drop = records
        .iter()
        .find(|r| r.action == MutationAction::Drop)
        .unwrap();
    assert_eq!(drop.prev_mid, Some(commit.id));
}

#[tokio::test]
async fn test_spike_suppression_is_recorded_once() {
    let db = Arc::new(FakeDb::new());
    let (executor, log) = executor_fixture(db.clone(), Mode::Apply).await;
    let tenant = TenantId::new("acme");
    let fp = QueryFingerprint::from_normalized(
        "select * from contacts where email = ?".to_owned(),
    );

    for _ in 0..2 {
        let outcome = DecisionOutcome {
            selected: Vec::new(),
            rejected: Vec::new(),
            suppressed_spikes: vec![(fp.clone(), 5000)],
        };
        executor.apply(&tenant, outcome, Utc::now()).await.unwrap();
    }
    let records = log.scan(|r| r.action == MutationAction::SpikeSuppressed);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].details["count"], json!(5000));
}

#[tokio::test]
async fn test_rejected_candidates_get_deferred_records() {
    let db = Arc::new(FakeDb::new());
    let (executor, log) = executor_fixture(db.clone(), Mode::Apply).await;
    let outcome = DecisionOutcome {
        selected: Vec::new(),
        rejected: vec![(candidate(&["email"]), "budget-exceeded".to_owned())],
        suppressed_spikes: Vec::new(),
    };
    executor
        .apply(&TenantId::new("acme"), outcome, Utc::now())
        .await
        .unwrap();
    let records = log.scan(|r| r.action == MutationAction::Deferred);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].details["reason"], json!("budget-exceeded"));
}
