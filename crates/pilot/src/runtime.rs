//! The daemon's assembled state. Everything a subsystem needs is constructed
//! here once and passed by reference; there is no module-level global state.
//! A configuration reload builds a fresh `Runtime` and swaps the shared
//! handle.
use std::sync::Arc;

use catalog::{
    BootstrapMode,
    Catalog,
    ExpressionProfile,
};
use chrono::{
    DateTime,
    Utc,
};
use common::{
    db::DbAdapter,
    shutdown::{
        ShutdownMessage,
        ShutdownSignal,
    },
    types::TenantId,
};
use decision::{
    default_scorers,
    DecisionEngine,
};
use executor::{
    Executor,
    LiveIndexCache,
    Mode,
};
use maintenance::MaintenanceLoop;
use mutation_log::{
    MutationLog,
    MutationLogWriter,
};
use parking_lot::Mutex;
use planner::PlannerClient;
use query_stats::QueryStatsStore;
use safeguards::Safeguards;

use crate::{
    bypass::{
        Bypass,
        COMPONENT_DECISION,
        COMPONENT_EXECUTOR,
        COMPONENT_MAINTENANCE,
    },
    read_api::ReadApi,
    rollback::RollbackPlane,
};

pub struct Runtime {
    pub db: Arc<dyn DbAdapter>,
    pub stats: Arc<QueryStatsStore>,
    pub catalog: Arc<Catalog>,
    pub profile: Arc<ExpressionProfile>,
    pub planner: Arc<PlannerClient>,
    pub log: MutationLog,
    pub safeguards: Arc<Safeguards>,
    pub live_cache: Arc<LiveIndexCache>,
    pub executor: Arc<Executor>,
    pub engine: Arc<DecisionEngine>,
    pub maintenance: Arc<MaintenanceLoop>,
    pub rollback: Arc<RollbackPlane>,
    pub bypass: Arc<Bypass>,
    pub read_api: Arc<ReadApi>,
    /// Fatal-error signaling path: any subsystem that hits a fatal failure
    /// signals here, and the scheduler's watcher takes the daemon to system
    /// bypass.
    pub shutdown: ShutdownSignal,
    shutdown_rx: async_broadcast::Receiver<ShutdownMessage>,
    log_writer: Mutex<Option<MutationLogWriter>>,
}

impl Runtime {
    pub async fn start(
        db: Arc<dyn DbAdapter>,
        bootstrap: BootstrapMode,
        bypass: Arc<Bypass>,
    ) -> anyhow::Result<Arc<Self>> {
        let (log, log_writer) = MutationLog::open(db.clone()).await?;
        let catalog = Arc::new(Catalog::bootstrap(db.clone(), log.clone(), bootstrap).await?);
        let profile = Arc::new(ExpressionProfile::load(db.clone()).await?);
        let planner = Arc::new(PlannerClient::new(db.clone()));
        let stats = QueryStatsStore::new();
        let safeguards = Arc::new(Safeguards::new(db.clone())?);
        let live_cache = Arc::new(LiveIndexCache::new(db.clone()));
        let executor = Arc::new(Executor::new(
            db.clone(),
            planner.clone(),
            log.clone(),
            safeguards.clone(),
            live_cache.clone(),
            Mode::from_knob(),
        ));
        let engine = Arc::new(DecisionEngine::new(
            db.clone(),
            planner.clone(),
            stats.clone(),
            catalog.clone(),
            profile.clone(),
            default_scorers(),
        ));
        let maintenance = Arc::new(MaintenanceLoop::new(
            db.clone(),
            log.clone(),
            executor.clone(),
            safeguards.clone(),
        ));
        let rollback = Arc::new(RollbackPlane::new(
            db.clone(),
            log.clone(),
            planner.clone(),
            live_cache.clone(),
        ));
        let read_api = Arc::new(ReadApi::new(
            stats.clone(),
            maintenance.report_handle(),
            log.clone(),
            bypass.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = async_broadcast::broadcast(8);
        let shutdown = ShutdownSignal::new(shutdown_tx);
        Ok(Arc::new(Self {
            db,
            stats,
            catalog,
            profile,
            planner,
            log,
            safeguards,
            live_cache,
            executor,
            engine,
            maintenance,
            rollback,
            bypass,
            read_api,
            shutdown,
            shutdown_rx,
            log_writer: Mutex::new(Some(log_writer)),
        }))
    }

    /// A fresh receiver on the fatal-error channel, for the scheduler's
    /// watcher.
    pub fn shutdown_receiver(&self) -> async_broadcast::Receiver<ShutdownMessage> {
        self.shutdown_rx.clone()
    }

    /// One decision pass over every observed tenant, honoring the bypass
    /// plane: a bypassed executor (or a read-only system) demotes the pass
    /// to advisory recording.
    pub async fn decision_pass(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        if self.bypass.component_explicitly_bypassed(COMPONENT_DECISION) {
            return Ok(());
        }
        let effective_mode = if !self.bypass.ddl_allowed()
            || !self.bypass.component_enabled(COMPONENT_EXECUTOR)
            || !self.bypass.feature_enabled("index-creation")
        {
            Mode::Advisory
        } else {
            Mode::from_knob()
        };
        self.executor.set_mode(effective_mode);

        let mut tenants = self.stats.tenants();
        if tenants.is_empty() {
            tenants.push(TenantId::global());
        }
        for tenant in tenants {
            let mut outcome = self.engine.pass(&tenant, now).await?;
            if !self.bypass.feature_enabled("redundancy-pruning") {
                for candidate in &mut outcome.selected {
                    candidate.paired_drop = None;
                }
            }
            self.executor.apply(&tenant, outcome, now).await?;
        }
        Ok(())
    }

    pub async fn maintenance_pass(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        if !self.bypass.component_enabled(COMPONENT_MAINTENANCE) {
            return Ok(());
        }
        self.maintenance.run_once(now).await?;
        self.stats.flush(&*self.db).await?;
        if self.bypass.feature_enabled("regression-watch") && self.bypass.ddl_allowed() {
            self.rollback.regression_pass().await?;
        }
        self.safeguards.rate_limiter.retarget();
        Ok(())
    }

    /// Shutdown step (iii): wait for the log writer to drain. The scheduler
    /// must already be stopped and in-flight builds cancelled.
    pub async fn drain_log_writer(&self) {
        let writer = self.log_writer.lock().take();
        if let Some(writer) = writer {
            // Appends are acknowledged synchronously, so an idle queue
            // drains immediately; the join is bounded by a grace period.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer.drain()).await;
        }
    }
}
