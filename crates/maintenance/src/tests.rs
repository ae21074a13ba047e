use std::{
    sync::Arc,
    time::Duration,
};

use chrono::{
    Duration as ChronoDuration,
    Utc,
};
use common::{
    db::MaintenanceOp,
    testing::FakeDb,
    types::{
        IndexMethod,
        LiveIndex,
        MutationAction,
    },
};
use executor::{
    Executor,
    LiveIndexCache,
    Mode,
};
use mutation_log::MutationLog;
use planner::PlannerClient;
use safeguards::Safeguards;

use crate::MaintenanceLoop;

fn live(name: &str, columns: &[&str], valid: bool) -> LiveIndex {
    LiveIndex {
        name: name.parse().unwrap(),
        table: "contacts".parse().unwrap(),
        columns: columns.iter().map(|c| c.parse().unwrap()).collect(),
        predicate: None,
        method: IndexMethod::Ordered,
        size_bytes: 1 << 20,
        scan_count: 1_000,
        last_used: Some(Utc::now()),
        bloat_fraction: 0.0,
        valid,
        created_by: None,
    }
}

async fn fixture(db: Arc<FakeDb>) -> (MaintenanceLoop, MutationLog) {
    db.add_table(&"contacts".parse().unwrap(), 100_000);
    let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
    let planner = Arc::new(PlannerClient::new(db.clone()));
    let safeguards = Arc::new(Safeguards::new(db.clone()).unwrap());
    let live_cache = Arc::new(LiveIndexCache::new(db.clone()));
    let executor = Arc::new(Executor::new(
        db.clone(),
        planner,
        log.clone(),
        safeguards.clone(),
        live_cache,
        Mode::Apply,
    ));
    let maintenance = MaintenanceLoop::new(db, log.clone(), executor, safeguards);
    (maintenance, log)
}

#[tokio::test]
async fn test_integrity_sweep_drops_invalid_indexes() {
    let db = Arc::new(FakeDb::new());
    db.add_live_index(live("ix_contacts_bad", &["email"], false));
    db.add_live_index(live("ix_contacts_good", &["tenant_id"], true));
    db.set_stale_locks(2);
    let (maintenance, log) = fixture(db.clone()).await;

    let report = maintenance.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.invalid_cleaned, 1);
    assert_eq!(report.stale_locks_released, 2);
    assert!(!db.live_index_names().iter().any(|n| &**n == "ix_contacts_bad"));
    assert!(db.live_index_names().iter().any(|n| &**n == "ix_contacts_good"));
    let drops = log.scan(|r| r.action == MutationAction::Drop);
    assert_eq!(drops.len(), 1);
}

#[tokio::test]
async fn test_unused_index_is_proposed_not_dropped() {
    let db = Arc::new(FakeDb::new());
    let mut idle = live("ix_contacts_idle", &["email"], true);
    idle.scan_count = 3;
    idle.last_used = Some(Utc::now() - ChronoDuration::days(90));
    db.add_live_index(idle);
    let (maintenance, log) = fixture(db.clone()).await;

    let report = maintenance.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.unused_proposed, 1);
    // Default behavior: propose only; the index survives.
    assert!(db.live_index_names().iter().any(|n| &**n == "ix_contacts_idle"));
    let proposals = log.scan(|r| {
        r.action == MutationAction::Propose
            && r.details.get("reason").and_then(|v| v.as_str()) == Some("unused-index")
    });
    assert_eq!(proposals.len(), 1);

    // A second pass does not repeat the proposal.
    let report = maintenance.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.unused_proposed, 0);
}

#[tokio::test]
async fn test_redundancy_detection_proposes_consolidation() {
    let db = Arc::new(FakeDb::new());
    db.add_live_index(live("ix_contacts_tenant_id", &["tenant_id"], true));
    db.add_live_index(live(
        "ix_contacts_tenant_id_email",
        &["tenant_id", "email"],
        true,
    ));
    let (maintenance, log) = fixture(db.clone()).await;

    let report = maintenance.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.redundancy_proposed, 1);
    let proposals = log.scan(|r| {
        r.details.get("reason").and_then(|v| v.as_str()) == Some("prefix-redundant")
    });
    assert_eq!(proposals.len(), 1);
    assert_eq!(
        proposals[0].details["dominated_by"],
        serde_json::json!("ix_contacts_tenant_id_email")
    );
}

#[tokio::test]
async fn test_bloat_triggers_concurrent_reindex() {
    let db = Arc::new(FakeDb::new());
    let mut bloated = live("ix_contacts_bloated", &["email"], true);
    bloated.bloat_fraction = 0.6;
    db.add_live_index(bloated);
    let (maintenance, log) = fixture(db.clone()).await;

    let report = maintenance.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.reindexed, 1);
    assert!(db
        .maintenance_log()
        .iter()
        .any(|(op, table)| *op == MaintenanceOp::Reindex && &**table == "contacts"));
    assert_eq!(log.scan(|r| r.action == MutationAction::Rebuild).len(), 1);
}

#[tokio::test]
async fn test_stale_statistics_get_analyze() {
    let db = Arc::new(FakeDb::new());
    let (maintenance, _log) = fixture(db.clone()).await;
    db.set_analyze_age(
        &"contacts".parse().unwrap(),
        *common::knobs::STATS_STALENESS + Duration::from_secs(60),
    );

    let report = maintenance.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.analyzed, 1);
    assert!(db
        .maintenance_log()
        .iter()
        .any(|(op, _)| *op == MaintenanceOp::Analyze));
}

#[tokio::test]
async fn test_health_report_reflects_live_set() {
    let db = Arc::new(FakeDb::new());
    db.add_live_index(live("ix_contacts_tenant_id", &["tenant_id"], true));
    let (maintenance, _log) = fixture(db.clone()).await;

    let report = maintenance.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.index_count, 1);
    assert_eq!(report.indexes[0].name, "ix_contacts_tenant_id");
    assert!(report.generated_at.is_some());

    // The shared handle sees the same report.
    let handle = maintenance.report_handle();
    assert_eq!(handle.read().index_count, 1);
}
