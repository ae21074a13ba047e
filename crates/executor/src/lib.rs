//! The executor: drives each emitted candidate through
//! PROPOSED -> GATED -> BUILDING -> VALIDATING -> COMMITTED, with DEFERRED,
//! FAILED_INVALID, and ROLLED_BACK side exits. Every state transition writes
//! a mutation record before the corresponding database effect, and the
//! executor is the only writer of the mutation log apart from the rollback
//! plane.
mod live_cache;
mod metrics;
pub mod naming;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use chrono::{
    DateTime,
    Utc,
};
use common::{
    backoff::Backoff,
    db::{
        DbAdapter,
        DdlOutcome,
    },
    identifier::IndexName,
    knobs::{
        AUTO_INDEXER_MODE,
        BUILD_INITIAL_BACKOFF,
        BUILD_MAX_ATTEMPTS,
        BUILD_MAX_BACKOFF,
        IMPROVEMENT_THRESHOLD,
    },
    types::{
        IndexCandidate,
        IndexDefinition,
        IndexMethod,
        MutationAction,
        TenantId,
    },
};
use decision::DecisionOutcome;
use errors::{
    ErrorMetadataAnyhowExt,
    report_error,
};
use mutation_log::{
    MutationLog,
    NewMutation,
};
use parking_lot::Mutex;
use planner::PlannerClient;
use safeguards::{
    CanaryTrial,
    CanaryVerdict,
    GateOutcome,
    Safeguards,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub use crate::live_cache::LiveIndexCache;
use crate::metrics::{
    log_build_outcome,
    log_build_timer,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Record proposals, never touch the schema.
    Advisory,
    Apply,
}

impl Mode {
    pub fn from_knob() -> Self {
        match AUTO_INDEXER_MODE.as_str() {
            "apply" => Mode::Apply,
            _ => Mode::Advisory,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BuildState {
    Proposed,
    Deferred,
    FailedInvalid,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct CandidateResult {
    pub candidate: IndexCandidate,
    pub state: BuildState,
    pub index_name: Option<IndexName>,
    pub reason: Option<String>,
}

struct InFlight {
    started: Instant,
    cancel: CancellationToken,
}

pub struct Executor {
    db: Arc<dyn DbAdapter>,
    planner: Arc<PlannerClient>,
    log: MutationLog,
    safeguards: Arc<Safeguards>,
    live_cache: Arc<LiveIndexCache>,
    mode: Mutex<Mode>,
    in_flight: Mutex<HashMap<IndexName, InFlight>>,
}

enum BuildAttempt {
    Committed,
    FailedInvalid,
    LockTimeoutExhausted,
    Cancelled,
    Fatal(anyhow::Error),
}

impl Executor {
    pub fn new(
        db: Arc<dyn DbAdapter>,
        planner: Arc<PlannerClient>,
        log: MutationLog,
        safeguards: Arc<Safeguards>,
        live_cache: Arc<LiveIndexCache>,
        mode: Mode,
    ) -> Self {
        Self {
            db,
            planner,
            log,
            safeguards,
            live_cache,
            mode: Mutex::new(mode),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    /// Swap the effective mode; the bypass plane forces Advisory when the
    /// executor component or the whole system is bypassed.
    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    /// Apply one decision outcome: record suppressions and rejections, then
    /// drive each selected candidate through the state machine in order.
    pub async fn apply(
        &self,
        tenant: &TenantId,
        outcome: DecisionOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CandidateResult>> {
        for (fingerprint, count) in &outcome.suppressed_spikes {
            let already_recorded = !self
                .log
                .scan(|r| {
                    r.action == MutationAction::SpikeSuppressed
                        && r.details.get("fingerprint").and_then(|v| v.as_str())
                            == Some(fingerprint.as_str())
                })
                .is_empty();
            if already_recorded {
                continue;
            }
            self.log
                .append(NewMutation {
                    tenant: Some(tenant.clone()),
                    action: MutationAction::SpikeSuppressed,
                    table: None,
                    index: None,
                    details: json!({"fingerprint": fingerprint.as_str(), "count": count}),
                    prev_mid: None,
                })
                .await?;
        }

        for (candidate, reason) in &outcome.rejected {
            self.log
                .append(NewMutation {
                    tenant: Some(tenant.clone()),
                    action: MutationAction::Deferred,
                    table: Some(candidate.table.clone()),
                    index: None,
                    details: json!({
                        "reason": reason,
                        "columns": candidate.column_list(),
                        "rationale": candidate.rationale,
                    }),
                    prev_mid: None,
                })
                .await?;
        }

        let mut results = Vec::with_capacity(outcome.selected.len());
        for candidate in outcome.selected {
            let result = self.process(candidate, now).await?;
            log_build_outcome(result.state);
            results.push(result);
        }
        Ok(results)
    }

    async fn process(
        &self,
        candidate: IndexCandidate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CandidateResult> {
        let propose_mid = self
            .log
            .append(NewMutation {
                tenant: Some(candidate.tenant.clone()),
                action: MutationAction::Propose,
                table: Some(candidate.table.clone()),
                index: None,
                details: candidate.rationale.clone(),
                prev_mid: None,
            })
            .await?;

        if self.mode() == Mode::Advisory {
            return Ok(CandidateResult {
                candidate,
                state: BuildState::Proposed,
                index_name: None,
                reason: Some("advisory-mode".to_owned()),
            });
        }

        // GATED.
        let gate = self
            .safeguards
            .clear_for_create(
                &candidate.tenant,
                &candidate.table,
                candidate.size_estimate_bytes,
                now,
                false,
            )
            .await;
        let (reservation, probe) = match gate {
            GateOutcome::Allow { reservation, probe } => (reservation, probe),
            GateOutcome::Defer { reason } => {
                self.log
                    .append(NewMutation {
                        tenant: Some(candidate.tenant.clone()),
                        action: MutationAction::Deferred,
                        table: Some(candidate.table.clone()),
                        index: None,
                        details: json!({"reason": reason, "state": "GATED"}),
                        prev_mid: Some(propose_mid),
                    })
                    .await?;
                return Ok(CandidateResult {
                    candidate,
                    state: BuildState::Deferred,
                    index_name: None,
                    reason: Some(reason.to_owned()),
                });
            },
        };

        let live = self.live_cache.get().await?;
        let taken: Vec<IndexName> = live.iter().map(|ix| ix.name.clone()).collect();
        let name = naming::index_name(&candidate, &taken);
        let definition = IndexDefinition {
            name: name.clone(),
            table: candidate.table.clone(),
            columns: candidate.columns.clone(),
            predicate: candidate.predicate.clone(),
            method: candidate.method,
        };

        // BUILDING: intent record first, then the DDL.
        let create_mid = self
            .log
            .append(NewMutation {
                tenant: Some(candidate.tenant.clone()),
                action: MutationAction::Create,
                table: Some(candidate.table.clone()),
                index: Some(name.clone()),
                details: json!({
                    "definition": format!("{definition:?}"),
                    "probe": probe,
                    "fingerprints": candidate
                        .motivating_fingerprints
                        .iter()
                        .map(|fp| fp.as_str())
                        .collect::<Vec<_>>(),
                    "full_scan_cost": candidate
                        .rationale
                        .get("full_scan_cost")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                }),
                prev_mid: Some(propose_mid),
            })
            .await?;

        let mut attempt = self.build_with_retry(&definition).await?;
        // The method hint is advisory: a database that rejects it gets the
        // same index as an ordered build instead.
        if matches!(attempt, BuildAttempt::Fatal(_)) && definition.method != IndexMethod::Ordered {
            let fallback = IndexDefinition {
                method: IndexMethod::Ordered,
                ..definition.clone()
            };
            tracing::warn!(
                "index method {} rejected for {}; falling back to ordered",
                definition.method.sql_method(),
                definition.name,
            );
            attempt = self.build_with_retry(&fallback).await?;
        }
        match attempt {
            BuildAttempt::Committed => {},
            BuildAttempt::Fatal(e) => {
                self.safeguards
                    .breaker
                    .record_failure(&candidate.table, e.error_code());
                self.log
                    .append(NewMutation {
                        tenant: Some(candidate.tenant.clone()),
                        action: MutationAction::CreateFailed,
                        table: Some(candidate.table.clone()),
                        index: Some(name.clone()),
                        details: json!({"error": e.short_msg()}),
                        prev_mid: Some(create_mid),
                    })
                    .await?;
                drop(reservation);
                return Err(e);
            },
            BuildAttempt::FailedInvalid => {
                self.safeguards
                    .breaker
                    .record_failure(&candidate.table, Some(errors::ErrorCode::Timeout));
                self.log
                    .append(NewMutation {
                        tenant: Some(candidate.tenant.clone()),
                        action: MutationAction::CreateFailed,
                        table: Some(candidate.table.clone()),
                        index: Some(name.clone()),
                        details: json!({"reason": "build-left-invalid-object"}),
                        prev_mid: Some(create_mid),
                    })
                    .await?;
                drop(reservation);
                self.live_cache.invalidate();
                return Ok(CandidateResult {
                    candidate,
                    state: BuildState::FailedInvalid,
                    index_name: Some(name),
                    reason: Some("build-left-invalid-object".to_owned()),
                });
            },
            attempt @ (BuildAttempt::LockTimeoutExhausted | BuildAttempt::Cancelled) => {
                let reason = match attempt {
                    BuildAttempt::LockTimeoutExhausted => "lock-timeout",
                    _ => "cancelled",
                };
                self.safeguards
                    .breaker
                    .record_failure(&candidate.table, Some(errors::ErrorCode::LockTimeout));
                self.log
                    .append(NewMutation {
                        tenant: Some(candidate.tenant.clone()),
                        action: MutationAction::CreateFailed,
                        table: Some(candidate.table.clone()),
                        index: Some(name.clone()),
                        details: json!({"reason": reason}),
                        prev_mid: Some(create_mid),
                    })
                    .await?;
                drop(reservation);
                return Ok(CandidateResult {
                    candidate,
                    state: BuildState::Deferred,
                    index_name: Some(name),
                    reason: Some(reason.to_owned()),
                });
            },
        }
        self.live_cache.invalidate();

        // VALIDATING.
        let validated = self.validate(&candidate, &name).await;
        if !validated {
            // Roll back: the drop record precedes the drop itself.
            self.log
                .append(NewMutation {
                    tenant: Some(candidate.tenant.clone()),
                    action: MutationAction::Drop,
                    table: Some(candidate.table.clone()),
                    index: Some(name.clone()),
                    details: json!({"reason": "validation-regression"}),
                    prev_mid: Some(create_mid),
                })
                .await?;
            self.db.drop_index(&name).await?;
            self.live_cache.invalidate();
            drop(reservation);
            self.safeguards
                .breaker
                .record_failure(&candidate.table, None);
            return Ok(CandidateResult {
                candidate,
                state: BuildState::RolledBack,
                index_name: Some(name),
                reason: Some("validation-regression".to_owned()),
            });
        }

        // COMMITTED.
        let commit_mid = self
            .log
            .append(NewMutation {
                tenant: Some(candidate.tenant.clone()),
                action: MutationAction::Commit,
                table: Some(candidate.table.clone()),
                index: Some(name.clone()),
                details: json!({"probe": probe}),
                prev_mid: Some(create_mid),
            })
            .await?;
        reservation.commit();
        self.safeguards.breaker.record_success(&candidate.table, None);
        self.live_cache.invalidate();

        // Paired drop of the prefix-dominated predecessor, only now that the
        // replacement is committed.
        if let Some(dominated) = &candidate.paired_drop {
            self.log
                .append(NewMutation {
                    tenant: Some(candidate.tenant.clone()),
                    action: MutationAction::Drop,
                    table: Some(candidate.table.clone()),
                    index: Some(dominated.clone()),
                    details: json!({"reason": "prefix-consolidation", "replacement": name.to_string()}),
                    prev_mid: Some(commit_mid),
                })
                .await?;
            self.db.drop_index(dominated).await?;
            self.live_cache.invalidate();
        }

        Ok(CandidateResult {
            candidate,
            state: BuildState::Committed,
            index_name: Some(name),
            reason: None,
        })
    }

    async fn build_with_retry(
        &self,
        definition: &IndexDefinition,
    ) -> anyhow::Result<BuildAttempt> {
        let _timer = log_build_timer();
        let cancel = CancellationToken::new();
        self.in_flight.lock().insert(
            definition.name.clone(),
            InFlight {
                started: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        let result = self.build_attempts(definition, &cancel).await;
        self.in_flight.lock().remove(&definition.name);
        result
    }

    async fn build_attempts(
        &self,
        definition: &IndexDefinition,
        cancel: &CancellationToken,
    ) -> anyhow::Result<BuildAttempt> {
        let mut backoff = Backoff::new(*BUILD_INITIAL_BACKOFF, *BUILD_MAX_BACKOFF);
        loop {
            let outcome = tokio::select! {
                outcome = self.db.create_index(definition, true) => outcome,
                _ = cancel.cancelled() => {
                    self.db.cancel_index_build(&definition.name).await?;
                    return Ok(BuildAttempt::Cancelled);
                },
            };
            let retryable = match outcome {
                Ok(DdlOutcome::Committed) => return Ok(BuildAttempt::Committed),
                Ok(DdlOutcome::FailedInvalid) => return Ok(BuildAttempt::FailedInvalid),
                Ok(DdlOutcome::LockTimeout) => true,
                Err(e) if e.is_retryable() => {
                    report_error(&e);
                    true
                },
                Err(e) => return Ok(BuildAttempt::Fatal(e)),
            };
            if retryable {
                if backoff.failures() + 1 >= *BUILD_MAX_ATTEMPTS {
                    return Ok(BuildAttempt::LockTimeoutExhausted);
                }
                let delay = backoff.fail(&mut rand::rng());
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Re-EXPLAIN the motivating fingerprints. The new index passes when the
    /// planner adopts it for at least one fingerprint, or the summed
    /// estimated cost drops by the improvement threshold. Canary mode runs
    /// the same checks over a bounded sample instead.
    async fn validate(&self, candidate: &IndexCandidate, name: &IndexName) -> bool {
        if candidate.motivating_fingerprints.is_empty() {
            // Foreign-key candidates have no motivating statement; the index
            // stands on referential traffic alone.
            return true;
        }
        let baseline = candidate
            .rationale
            .get("full_scan_cost")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::MAX);

        if self.safeguards.canary.enabled {
            let mut trial = CanaryTrial::new(&self.safeguards.canary);
            let mut fps = candidate.motivating_fingerprints.iter().cycle();
            loop {
                let fp = fps.next().expect("cycle over non-empty set");
                let (sql, params) = decision::scoring::fingerprint_to_sql(fp);
                let improved = match self.planner.explain_fresh(fp, &sql, &params, false).await {
                    Ok(plan) => {
                        plan.uses_index(name) || plan.total_cost() < baseline * (1.0 - *IMPROVEMENT_THRESHOLD)
                    },
                    Err(_) => false,
                };
                match trial.record(improved) {
                    Some(CanaryVerdict::Promote) => return true,
                    Some(CanaryVerdict::Rollback) => return false,
                    None => {},
                }
            }
        }

        let mut adopted = false;
        let mut total_before = 0.0;
        let mut total_after = 0.0;
        for fp in &candidate.motivating_fingerprints {
            let (sql, params) = decision::scoring::fingerprint_to_sql(fp);
            match self.planner.explain_fresh(fp, &sql, &params, false).await {
                Ok(plan) => {
                    adopted |= plan.uses_index(name);
                    total_before += baseline;
                    total_after += plan.total_cost();
                },
                Err(e) => {
                    report_error(&e);
                    // No planner, no verdict: count the fingerprint as
                    // unimproved rather than guessing in the index's favor.
                    total_before += baseline;
                    total_after += baseline;
                },
            }
        }
        adopted || (total_before > 0.0 && total_after <= total_before * (1.0 - *IMPROVEMENT_THRESHOLD))
    }

    /// Builds that have been in BUILDING longer than the timeout.
    pub fn hanging_builds(&self, older_than: Duration) -> Vec<IndexName> {
        self.in_flight
            .lock()
            .iter()
            .filter(|(_, state)| state.started.elapsed() >= older_than)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Cancel one in-flight build (hang reaping).
    pub fn cancel_build(&self, name: &IndexName) {
        if let Some(state) = self.in_flight.lock().get(name) {
            state.cancel.cancel();
        }
    }

    /// Cancel every in-flight build (emergency write-latency ceiling).
    pub fn cancel_all_builds(&self) {
        for state in self.in_flight.lock().values() {
            state.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests;
