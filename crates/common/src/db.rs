//! The database adapter contract. One implementation speaks to Postgres
//! (`crates/pg`); an in-memory fake backs the test suites. The adapter owns
//! pooling and timeouts but performs no retries; the executor decides how a
//! failure is handled.
use std::{
    collections::BTreeMap,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{
    identifier::{
        ColumnName,
        IndexName,
        TableName,
    },
    plan::Plan,
    types::{
        CatalogEntry,
        IndexDefinition,
        LiveIndex,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Float(v) => Some(*v),
            SqlValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    pub fn get(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Clone, Debug)]
pub enum ExecResult {
    Rows(RowSet),
    Affected(u64),
}

impl ExecResult {
    pub fn rows(self) -> RowSet {
        match self {
            ExecResult::Rows(r) => r,
            ExecResult::Affected(_) => RowSet::default(),
        }
    }
}

/// The three distinct completions of a non-blocking DDL statement. Everything
/// else surfaces as an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdlOutcome {
    Committed,
    /// The build failed partway and left an invalid object behind that the
    /// integrity sweep must clean up.
    FailedInvalid,
    LockTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaintenanceOp {
    Vacuum,
    Analyze,
    Reindex,
}

impl MaintenanceOp {
    pub fn verb(&self) -> &'static str {
        match self {
            MaintenanceOp::Vacuum => "VACUUM",
            MaintenanceOp::Analyze => "ANALYZE",
            MaintenanceOp::Reindex => "REINDEX",
        }
    }
}

#[async_trait]
pub trait DbAdapter: Send + Sync + 'static {
    /// Run a parameterized statement. Connection acquisition is internal and
    /// bounded; exhaustion surfaces as a PoolExhausted error.
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> anyhow::Result<ExecResult>;

    /// `EXPLAIN` (or `EXPLAIN ANALYZE`) a statement and parse the plan. No
    /// caching here; the planner client layers that on.
    async fn explain(&self, sql: &str, params: &[SqlValue], analyze: bool) -> anyhow::Result<Plan>;

    /// Create an index. `non_blocking` maps to the concurrent-build variant
    /// and the long-statement timeout.
    async fn create_index(
        &self,
        definition: &IndexDefinition,
        non_blocking: bool,
    ) -> anyhow::Result<DdlOutcome>;

    async fn drop_index(&self, index: &IndexName) -> anyhow::Result<()>;

    async fn introspect_schema(&self) -> anyhow::Result<Vec<CatalogEntry>>;

    async fn introspect_indexes(&self, table: Option<&TableName>)
        -> anyhow::Result<Vec<LiveIndex>>;

    async fn sample_values(
        &self,
        table: &TableName,
        column: &ColumnName,
        n: usize,
    ) -> anyhow::Result<Vec<SqlValue>>;

    async fn table_rowcount(&self, table: &TableName) -> anyhow::Result<u64>;

    /// Estimated distinct values in a column, for selectivity.
    async fn distinct_estimate(&self, table: &TableName, column: &ColumnName)
        -> anyhow::Result<u64>;

    /// Recent average write latency of the database, in milliseconds.
    async fn write_latency_ms(&self) -> anyhow::Result<f64>;

    /// VACUUM / ANALYZE / REINDEX, serialized platform-wide through the
    /// adapter's capacity-1 maintenance semaphore.
    async fn maintenance(&self, op: MaintenanceOp, table: &TableName) -> anyhow::Result<()>;

    /// Cancel an in-flight index build (hanging-build reaping).
    async fn cancel_index_build(&self, index: &IndexName) -> anyhow::Result<()>;

    /// Age since last ANALYZE, per table.
    async fn last_analyze_ages(&self) -> anyhow::Result<BTreeMap<TableName, Duration>>;

    /// Release advisory locks held longer than the threshold; returns how
    /// many were released.
    async fn release_stale_advisory_locks(&self, older_than: Duration) -> anyhow::Result<u64>;
}
