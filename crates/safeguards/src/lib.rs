//! The safeguard gates the executor must clear before any DDL: maintenance
//! window, circuit breaker, rate limit, write-latency throttle, and the
//! storage budget. Every gate answers with a value, never an error; denial
//! reasons travel into the mutation log's rationale snapshots.
pub mod breaker;
pub mod budget;
pub mod canary;
mod metrics;
pub mod rate_limiter;
pub mod throttle;
pub mod window;

use std::sync::Arc;

use chrono::{
    DateTime,
    Utc,
};
use common::{
    db::DbAdapter,
    identifier::TableName,
    types::TenantId,
};

pub use crate::{
    breaker::{
        BreakerDecision,
        CircuitBreaker,
    },
    budget::{
        Reservation,
        StorageBudget,
    },
    canary::{
        CanaryConfig,
        CanaryTrial,
        CanaryVerdict,
    },
    rate_limiter::{
        Action,
        ActionRateLimiter,
    },
    throttle::{
        ThrottleState,
        WriteLatencyThrottle,
    },
    window::MaintenanceWindows,
};
use crate::metrics::log_gate_denial;

/// Outcome of a gate pass. Deferred work is rescheduled, not failed.
#[derive(Debug)]
pub enum GateOutcome {
    /// Cleared; the storage reservation is held for the build's lifetime.
    Allow {
        reservation: Reservation,
        /// True when the circuit breaker admitted this as a half-open probe.
        probe: bool,
    },
    Defer {
        reason: &'static str,
    },
}

impl GateOutcome {
    pub fn deferred_reason(&self) -> Option<&'static str> {
        match self {
            GateOutcome::Allow { .. } => None,
            GateOutcome::Defer { reason } => Some(reason),
        }
    }
}

pub struct Safeguards {
    pub windows: MaintenanceWindows,
    pub breaker: CircuitBreaker,
    pub rate_limiter: ActionRateLimiter,
    pub throttle: WriteLatencyThrottle,
    pub budget: StorageBudget,
    pub canary: CanaryConfig,
}

impl Safeguards {
    pub fn new(db: Arc<dyn DbAdapter>) -> anyhow::Result<Self> {
        Ok(Self {
            windows: MaintenanceWindows::from_knob()?,
            breaker: CircuitBreaker::new(),
            rate_limiter: ActionRateLimiter::new(),
            throttle: WriteLatencyThrottle::new(db),
            budget: StorageBudget::new(),
            canary: CanaryConfig::from_knobs(),
        })
    }

    /// Run every CREATE gate in order. The first denial wins; the checks are
    /// ordered cheapest first so an open breaker or closed window costs
    /// nothing.
    pub async fn clear_for_create(
        &self,
        tenant: &TenantId,
        table: &TableName,
        size_estimate_bytes: u64,
        now: DateTime<Utc>,
        emergency: bool,
    ) -> GateOutcome {
        if !emergency && !self.windows.is_open(now) {
            return self.defer("window-closed");
        }
        let probe = match self.breaker.check(table) {
            BreakerDecision::Allow => false,
            BreakerDecision::Probe => true,
            BreakerDecision::Open => return self.defer("circuit-open"),
        };
        if !self.rate_limiter.try_acquire(Action::IndexCreation) {
            return self.defer("rate-limited");
        }
        match self.throttle.state().await {
            ThrottleState::Ok => {},
            ThrottleState::Defer | ThrottleState::Emergency => {
                return self.defer("write-latency");
            },
        }
        match self.budget.try_reserve(tenant, size_estimate_bytes) {
            Some(reservation) => GateOutcome::Allow { reservation, probe },
            None => self.defer("budget-exceeded"),
        }
    }

    /// Gate for maintenance actions (REINDEX, ANALYZE): window + rate only.
    pub fn clear_for_maintenance(&self, action: Action, now: DateTime<Utc>) -> Option<&'static str> {
        if !self.windows.is_open(now) {
            log_gate_denial("window-closed");
            return Some("window-closed");
        }
        if !self.rate_limiter.try_acquire(action) {
            log_gate_denial("rate-limited");
            return Some("rate-limited");
        }
        None
    }

    fn defer(&self, reason: &'static str) -> GateOutcome {
        log_gate_denial(reason);
        GateOutcome::Defer { reason }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use common::{
        testing::FakeDb,
        types::TenantId,
    };
    use errors::ErrorCode;

    use super::{
        GateOutcome,
        Safeguards,
    };

    fn fixture() -> (Arc<FakeDb>, Safeguards) {
        let db = Arc::new(FakeDb::new());
        let guards = Safeguards::new(db.clone()).unwrap();
        (db, guards)
    }

    #[tokio::test]
    async fn test_happy_path_allows_and_reserves() {
        let (_db, guards) = fixture();
        let outcome = guards
            .clear_for_create(
                &TenantId::new("acme"),
                &"contacts".parse().unwrap(),
                1024,
                Utc::now(),
                false,
            )
            .await;
        match outcome {
            GateOutcome::Allow { probe, .. } => assert!(!probe),
            GateOutcome::Defer { reason } => panic!("unexpected deferral: {reason}"),
        }
        assert_eq!(guards.budget.reserved_global(), 1024);
    }

    #[tokio::test]
    async fn test_open_breaker_defers_without_db_work() {
        let (db, guards) = fixture();
        let table: common::identifier::TableName = "orders".parse().unwrap();
        for _ in 0..*common::knobs::BREAKER_FAILURE_THRESHOLD {
            guards.breaker.record_failure(&table, Some(ErrorCode::LockTimeout));
        }
        let calls_before = db.exec_log().len();
        let outcome = guards
            .clear_for_create(&TenantId::new("acme"), &table, 1024, Utc::now(), false)
            .await;
        assert_eq!(outcome.deferred_reason(), Some("circuit-open"));
        assert_eq!(db.exec_log().len(), calls_before);
    }

    #[tokio::test]
    async fn test_write_latency_defers() {
        let (db, guards) = fixture();
        db.set_write_latency_ms(*common::knobs::WRITE_LATENCY_CEILING_MS + 1.0);
        let outcome = guards
            .clear_for_create(
                &TenantId::new("acme"),
                &"contacts".parse().unwrap(),
                1024,
                Utc::now(),
                false,
            )
            .await;
        assert_eq!(outcome.deferred_reason(), Some("write-latency"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_defers() {
        let (_db, guards) = fixture();
        let tenant = TenantId::new("acme");
        let huge = *common::knobs::TENANT_STORAGE_BUDGET_BYTES + 1;
        let outcome = guards
            .clear_for_create(&tenant, &"contacts".parse().unwrap(), huge, Utc::now(), false)
            .await;
        assert_eq!(outcome.deferred_reason(), Some("budget-exceeded"));
    }
}
