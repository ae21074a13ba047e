//! Circuit breaker over CREATE failures. Streaks are tracked both per table
//! and per error kind; which one trips the breaker is operator-selectable.
//! closed -> open after N consecutive failures; open -> half-open after the
//! cooldown; a probe success closes, a probe failure reopens.
use std::{
    collections::HashMap,
    time::Instant,
};

use common::{
    identifier::TableName,
    knobs::{
        BREAKER_COOLDOWN,
        BREAKER_FAILURE_THRESHOLD,
        BREAKER_SCOPE,
    },
};
use errors::ErrorCode;
use parking_lot::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakerDecision {
    Allow,
    /// The breaker is half-open; exactly one caller gets a probe.
    Probe,
    Open,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum BreakerKey {
    Table(TableName),
    Error(&'static str),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Entry {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: std::time::Duration,
    scope: Scope,
    entries: Mutex<HashMap<BreakerKey, Entry>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Scope {
    Table,
    Error,
    Either,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        let scope = match BREAKER_SCOPE.as_str() {
            "table" => Scope::Table,
            "error" => Scope::Error,
            _ => Scope::Either,
        };
        Self {
            threshold: *BREAKER_FAILURE_THRESHOLD,
            cooldown: *BREAKER_COOLDOWN,
            scope,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn with_config(threshold: u32, cooldown: std::time::Duration) -> Self {
        Self {
            threshold,
            cooldown,
            scope: Scope::Either,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn keys_for(&self, table: &TableName, error: Option<ErrorCode>) -> Vec<BreakerKey> {
        let mut keys = Vec::new();
        if matches!(self.scope, Scope::Table | Scope::Either) {
            keys.push(BreakerKey::Table(table.clone()));
        }
        if matches!(self.scope, Scope::Error | Scope::Either) {
            if let Some(code) = error {
                keys.push(BreakerKey::Error(code.metric_label()));
            }
        }
        keys
    }

    /// Gate a CREATE for the given table. An open breaker answers without
    /// any database work.
    pub fn check(&self, table: &TableName) -> BreakerDecision {
        let mut entries = self.entries.lock();
        let mut decision = BreakerDecision::Allow;
        for (key, entry) in entries.iter_mut() {
            let relevant = match key {
                BreakerKey::Table(t) => t == table,
                // Error-kind streaks gate every table.
                BreakerKey::Error(_) => true,
            };
            if !relevant {
                continue;
            }
            match entry.state {
                State::Closed => {},
                State::Open => {
                    let cooled = entry
                        .opened_at
                        .is_some_and(|at| at.elapsed() >= self.cooldown);
                    if cooled {
                        entry.state = State::HalfOpen;
                        if decision == BreakerDecision::Allow {
                            decision = BreakerDecision::Probe;
                        }
                    } else {
                        return BreakerDecision::Open;
                    }
                },
                State::HalfOpen => {
                    // A probe is already in flight.
                    return BreakerDecision::Open;
                },
            }
        }
        decision
    }

    pub fn record_failure(&self, table: &TableName, error: Option<ErrorCode>) {
        let mut entries = self.entries.lock();
        for key in self.keys_for(table, error) {
            let entry = entries.entry(key).or_default();
            match entry.state {
                State::HalfOpen => {
                    entry.state = State::Open;
                    entry.opened_at = Some(Instant::now());
                },
                _ => {
                    entry.consecutive_failures += 1;
                    if entry.consecutive_failures >= self.threshold {
                        entry.state = State::Open;
                        entry.opened_at = Some(Instant::now());
                        crate::metrics::log_breaker_opened();
                    }
                },
            }
        }
    }

    pub fn record_success(&self, table: &TableName, error: Option<ErrorCode>) {
        let mut entries = self.entries.lock();
        for key in self.keys_for(table, error) {
            if let Some(entry) = entries.get_mut(&key) {
                entry.state = State::Closed;
                entry.consecutive_failures = 0;
                entry.opened_at = None;
            }
        }
    }
}
