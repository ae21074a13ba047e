//! The maintenance loop: periodic hygiene over the live index set. Every
//! subtask is independently disablable and failure-isolated; one broken task
//! logs and the pass moves on.
mod metrics;

use std::sync::Arc;

use chrono::{
    DateTime,
    Duration as ChronoDuration,
    Utc,
};
use common::{
    db::{
        DbAdapter,
        MaintenanceOp,
    },
    knobs::{
        AUTO_CLEANUP_ENABLED,
        BLOAT_REBUILD_ENABLED,
        BLOAT_THRESHOLD,
        DAYS_UNUSED,
        HANGING_REAP_ENABLED,
        HANG_TIMEOUT,
        HEALTH_REPORT_ENABLED,
        INTEGRITY_SWEEP_ENABLED,
        MIN_SCANS,
        REDUNDANCY_DETECTION_ENABLED,
        STALE_LOCK_THRESHOLD,
        STATS_REFRESH_ENABLED,
        STATS_STALENESS,
        UNUSED_DETECTION_ENABLED,
    },
    types::{
        LiveIndex,
        MutationAction,
    },
};
use errors::report_error;
use executor::Executor;
use mutation_log::{
    MutationLog,
    NewMutation,
};
use parking_lot::RwLock;
use safeguards::{
    Action,
    Safeguards,
    ThrottleState,
};
use serde::Serialize;
use serde_json::json;

use crate::metrics::{
    log_maintenance_timer,
    log_task_outcome,
};

#[derive(Clone, Debug, Serialize)]
pub struct IndexHealth {
    pub name: String,
    pub table: String,
    pub size_bytes: u64,
    pub scan_count: u64,
    pub bloat_fraction: f64,
    pub valid: bool,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub index_count: usize,
    pub invalid_cleaned: usize,
    pub stale_locks_released: u64,
    pub unused_proposed: usize,
    pub redundancy_proposed: usize,
    pub reindexed: usize,
    pub analyzed: usize,
    pub hanging_reaped: usize,
    pub indexes: Vec<IndexHealth>,
}

pub struct MaintenanceLoop {
    db: Arc<dyn DbAdapter>,
    log: MutationLog,
    executor: Arc<Executor>,
    safeguards: Arc<Safeguards>,
    latest_report: Arc<RwLock<HealthReport>>,
}

impl MaintenanceLoop {
    pub fn new(
        db: Arc<dyn DbAdapter>,
        log: MutationLog,
        executor: Arc<Executor>,
        safeguards: Arc<Safeguards>,
    ) -> Self {
        Self {
            db,
            log,
            executor,
            safeguards,
            latest_report: Arc::new(RwLock::new(HealthReport::default())),
        }
    }

    /// Shared handle for the read API.
    pub fn report_handle(&self) -> Arc<RwLock<HealthReport>> {
        self.latest_report.clone()
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<HealthReport> {
        let _timer = log_maintenance_timer();
        let mut report = HealthReport::default();

        // The emergency ceiling cancels in-flight builds before anything
        // else runs.
        if self.safeguards.throttle.state().await == ThrottleState::Emergency {
            self.executor.cancel_all_builds();
        }

        if *INTEGRITY_SWEEP_ENABLED {
            match self.integrity_sweep().await {
                Ok((cleaned, locks)) => {
                    report.invalid_cleaned = cleaned;
                    report.stale_locks_released = locks;
                    log_task_outcome("integrity_sweep", true);
                },
                Err(e) => {
                    report_error(&e);
                    log_task_outcome("integrity_sweep", false);
                },
            }
        }

        let live = self.db.introspect_indexes(None).await?;

        if *UNUSED_DETECTION_ENABLED {
            match self.detect_unused(&live, now).await {
                Ok(count) => {
                    report.unused_proposed = count;
                    log_task_outcome("unused_detection", true);
                },
                Err(e) => {
                    report_error(&e);
                    log_task_outcome("unused_detection", false);
                },
            }
        }

        if *REDUNDANCY_DETECTION_ENABLED {
            match self.detect_redundancy(&live).await {
                Ok(count) => {
                    report.redundancy_proposed = count;
                    log_task_outcome("redundancy_detection", true);
                },
                Err(e) => {
                    report_error(&e);
                    log_task_outcome("redundancy_detection", false);
                },
            }
        }

        if *BLOAT_REBUILD_ENABLED {
            match self.rebuild_bloated(&live, now).await {
                Ok(count) => {
                    report.reindexed = count;
                    log_task_outcome("bloat_rebuild", true);
                },
                Err(e) => {
                    report_error(&e);
                    log_task_outcome("bloat_rebuild", false);
                },
            }
        }

        if *STATS_REFRESH_ENABLED {
            match self.refresh_statistics(now).await {
                Ok(count) => {
                    report.analyzed = count;
                    log_task_outcome("stats_refresh", true);
                },
                Err(e) => {
                    report_error(&e);
                    log_task_outcome("stats_refresh", false);
                },
            }
        }

        if *HANGING_REAP_ENABLED {
            let hanging = self.executor.hanging_builds(*HANG_TIMEOUT);
            report.hanging_reaped = hanging.len();
            for name in hanging {
                self.executor.cancel_build(&name);
            }
            log_task_outcome("hanging_reap", true);
        }

        if *HEALTH_REPORT_ENABLED {
            let live = self.db.introspect_indexes(None).await?;
            report.index_count = live.len();
            report.indexes = live
                .iter()
                .map(|ix| IndexHealth {
                    name: ix.name.to_string(),
                    table: ix.table.to_string(),
                    size_bytes: ix.size_bytes,
                    scan_count: ix.scan_count,
                    bloat_fraction: ix.bloat_fraction,
                    valid: ix.valid,
                    last_used: ix.last_used,
                })
                .collect();
            report.generated_at = Some(now);
            *self.latest_report.write() = report.clone();
            log_task_outcome("health_report", true);
        }

        Ok(report)
    }

    /// Drop invalid leftovers from failed builds and clear stale advisory
    /// locks.
    async fn integrity_sweep(&self) -> anyhow::Result<(usize, u64)> {
        let live = self.db.introspect_indexes(None).await?;
        let mut cleaned = 0;
        for index in live.iter().filter(|ix| !ix.valid) {
            self.log
                .append(NewMutation {
                    tenant: None,
                    action: MutationAction::Drop,
                    table: Some(index.table.clone()),
                    index: Some(index.name.clone()),
                    details: json!({"reason": "invalid-object-cleanup"}),
                    prev_mid: None,
                })
                .await?;
            self.db.drop_index(&index.name).await?;
            cleaned += 1;
        }
        let locks = self
            .db
            .release_stale_advisory_locks(*STALE_LOCK_THRESHOLD)
            .await?;
        Ok((cleaned, locks))
    }

    /// Unused indexes are proposed for DROP; the actual drop happens only
    /// with auto-cleanup switched on.
    async fn detect_unused(&self, live: &[LiveIndex], now: DateTime<Utc>) -> anyhow::Result<usize> {
        let cutoff = now - ChronoDuration::days(*DAYS_UNUSED as i64);
        let mut proposed = 0;
        for index in live.iter().filter(|ix| ix.valid) {
            let idle = index.scan_count < *MIN_SCANS
                && index.last_used.map(|used| used < cutoff).unwrap_or(true);
            if !idle {
                continue;
            }
            let already_proposed = !self
                .log
                .scan(|r| {
                    r.index.as_ref() == Some(&index.name)
                        && r.details.get("reason").and_then(|v| v.as_str())
                            == Some("unused-index")
                })
                .is_empty();
            if already_proposed && !*AUTO_CLEANUP_ENABLED {
                continue;
            }
            self.log
                .append(NewMutation {
                    tenant: None,
                    action: if *AUTO_CLEANUP_ENABLED {
                        MutationAction::Drop
                    } else {
                        MutationAction::Propose
                    },
                    table: Some(index.table.clone()),
                    index: Some(index.name.clone()),
                    details: json!({
                        "reason": "unused-index",
                        "scan_count": index.scan_count,
                        "last_used": index.last_used,
                    }),
                    prev_mid: None,
                })
                .await?;
            if *AUTO_CLEANUP_ENABLED {
                self.db.drop_index(&index.name).await?;
            }
            proposed += 1;
        }
        Ok(proposed)
    }

    /// Propose consolidation for live indexes prefix-dominated by another
    /// live index.
    async fn detect_redundancy(&self, live: &[LiveIndex]) -> anyhow::Result<usize> {
        let mut proposed = 0;
        for dominated in live.iter().filter(|ix| ix.valid) {
            let dominant = live.iter().find(|other| {
                other.valid
                    && other.name != dominated.name
                    && other.table == dominated.table
                    && other.columns.len() > dominated.columns.len()
                    && other.prefix_dominates(
                        &dominated.columns,
                        dominated.predicate.as_deref(),
                        dominated.method,
                    )
            });
            let Some(dominant) = dominant else {
                continue;
            };
            let already_proposed = !self
                .log
                .scan(|r| {
                    r.index.as_ref() == Some(&dominated.name)
                        && r.details.get("reason").and_then(|v| v.as_str())
                            == Some("prefix-redundant")
                })
                .is_empty();
            if already_proposed {
                continue;
            }
            self.log
                .append(NewMutation {
                    tenant: None,
                    action: MutationAction::Propose,
                    table: Some(dominated.table.clone()),
                    index: Some(dominated.name.clone()),
                    details: json!({
                        "reason": "prefix-redundant",
                        "dominated_by": dominant.name.to_string(),
                    }),
                    prev_mid: None,
                })
                .await?;
            proposed += 1;
        }
        Ok(proposed)
    }

    /// Concurrent REINDEX for bloated indexes, inside a window and under the
    /// reindex rate bucket.
    async fn rebuild_bloated(
        &self,
        live: &[LiveIndex],
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let mut rebuilt = 0;
        for index in live.iter().filter(|ix| ix.valid) {
            if index.bloat_fraction < *BLOAT_THRESHOLD {
                continue;
            }
            if self
                .safeguards
                .clear_for_maintenance(Action::Reindex, now)
                .is_some()
            {
                break;
            }
            let rebuild_mid = self
                .log
                .append(NewMutation {
                    tenant: None,
                    action: MutationAction::Rebuild,
                    table: Some(index.table.clone()),
                    index: Some(index.name.clone()),
                    details: json!({"bloat_fraction": index.bloat_fraction}),
                    prev_mid: index.created_by,
                })
                .await?;
            match self.db.maintenance(MaintenanceOp::Reindex, &index.table).await {
                Ok(()) => rebuilt += 1,
                Err(e) => {
                    self.log
                        .append(NewMutation {
                            tenant: None,
                            action: MutationAction::RebuildFailed,
                            table: Some(index.table.clone()),
                            index: Some(index.name.clone()),
                            details: json!({"error": format!("{e:#}")}),
                            prev_mid: Some(rebuild_mid),
                        })
                        .await?;
                    report_error(&e);
                },
            }
        }
        Ok(rebuilt)
    }

    /// ANALYZE tables whose statistics have gone stale.
    async fn refresh_statistics(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let ages = self.db.last_analyze_ages().await?;
        let mut analyzed = 0;
        for (table, age) in ages {
            if age < *STATS_STALENESS {
                continue;
            }
            if self
                .safeguards
                .clear_for_maintenance(Action::Analyze, now)
                .is_some()
            {
                break;
            }
            self.db.maintenance(MaintenanceOp::Analyze, &table).await?;
            analyzed += 1;
        }
        Ok(analyzed)
    }
}

#[cfg(test)]
mod tests;
