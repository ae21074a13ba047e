//! The read-only API surface consumed by external dashboards and the CLI:
//! recent performance aggregates, index health, the mutation log tail, and
//! the effective bypass set. Write operations stay on the CLI path.
use std::sync::Arc;

use axum::{
    extract::{
        Query,
        State,
    },
    routing::get,
    Json,
    Router,
};
use chrono::Utc;
use common::types::{
    MutationId,
    MutationRecord,
};
use maintenance::HealthReport;
use mutation_log::MutationLog;
use parking_lot::RwLock;
use query_stats::{
    QueryStatsStore,
    SnapshotFilter,
};
use serde::Deserialize;
use serde_json::{
    json,
    Value as JsonValue,
};

use crate::bypass::Bypass;

pub struct ReadApi {
    stats: Arc<QueryStatsStore>,
    health: Arc<RwLock<HealthReport>>,
    log: MutationLog,
    bypass: Arc<Bypass>,
}

impl ReadApi {
    pub fn new(
        stats: Arc<QueryStatsStore>,
        health: Arc<RwLock<HealthReport>>,
        log: MutationLog,
        bypass: Arc<Bypass>,
    ) -> Self {
        Self {
            stats,
            health,
            log,
            bypass,
        }
    }

    /// Recent aggregates: fingerprint counts, latencies, drop counter.
    pub fn performance(&self) -> JsonValue {
        let mut snapshot = self.stats.snapshot(&SnapshotFilter::default(), Utc::now());
        snapshot.sort_by(|a, b| b.count.cmp(&a.count));
        let top: Vec<JsonValue> = snapshot
            .iter()
            .take(50)
            .map(|s| {
                json!({
                    "tenant": s.tenant.as_str(),
                    "fingerprint": s.fingerprint.as_str(),
                    "count": s.count,
                    "ewma_ms": s.ewma_ms,
                    "p95_ms": s.p95_ms,
                    "p99_ms": s.p99_ms,
                    "distinct_params": s.distinct_params,
                    "last_seen": s.last_seen,
                })
            })
            .collect();
        json!({
            "fingerprints": snapshot.len(),
            "ingest_dropped": self.stats.dropped_count(),
            "top": top,
        })
    }

    pub fn health(&self) -> HealthReport {
        self.health.read().clone()
    }

    pub fn mutations(&self, since: MutationId) -> Vec<MutationRecord> {
        self.log.tail_since(since)
    }

    pub fn bypass(&self) -> JsonValue {
        self.bypass.effective()
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                "/performance",
                get(|State(api): State<Arc<ReadApi>>| async move { Json(api.performance()) }),
            )
            .route(
                "/health",
                get(|State(api): State<Arc<ReadApi>>| async move { Json(api.health()) }),
            )
            .route(
                "/mutations",
                get(
                    |State(api): State<Arc<ReadApi>>, Query(params): Query<MutationsParams>| async move {
                        Json(api.mutations(MutationId(params.since.unwrap_or(0))))
                    },
                ),
            )
            .route(
                "/bypass",
                get(|State(api): State<Arc<ReadApi>>| async move { Json(api.bypass()) }),
            )
            .with_state(self)
    }
}

#[derive(Deserialize)]
struct MutationsParams {
    since: Option<u64>,
}
