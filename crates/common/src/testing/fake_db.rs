//! In-memory stand-in for the Postgres adapter. Tables, indexes, and planner
//! behavior are scripted by the test; the daemon's subsystems run against it
//! unchanged.
use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;

use crate::{
    db::{
        DbAdapter,
        DdlOutcome,
        ExecResult,
        MaintenanceOp,
        RowSet,
        SqlValue,
    },
    identifier::{
        ColumnName,
        IndexName,
        TableName,
    },
    plan::{
        Plan,
        PlanNode,
    },
    types::{
        CatalogEntry,
        IndexDefinition,
        LiveIndex,
    },
};

#[derive(Clone, Debug)]
pub enum ScriptedDdl {
    Outcome(DdlOutcome),
    Error(errors::ErrorMetadata),
}

#[derive(Default)]
struct FakeTable {
    rowcount: u64,
    distinct: BTreeMap<ColumnName, u64>,
}

#[derive(Default)]
struct Inner {
    schema: Vec<CatalogEntry>,
    tables: BTreeMap<TableName, FakeTable>,
    indexes: BTreeMap<IndexName, LiveIndex>,
    scripted_ddl: VecDeque<ScriptedDdl>,
    scripted_rows: VecDeque<RowSet>,
    exec_log: Vec<String>,
    ddl_log: Vec<String>,
    maintenance_log: Vec<(MaintenanceOp, TableName)>,
    cancelled_builds: Vec<IndexName>,
    samples: BTreeMap<(TableName, ColumnName), Vec<SqlValue>>,
    analyze_ages: BTreeMap<TableName, Duration>,
    write_latency_ms: f64,
    stale_locks: u64,
    planner_uses_indexes: bool,
    explain_failures_remaining: u32,
    explain_calls: u64,
}

pub struct FakeDb {
    inner: Mutex<Inner>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                write_latency_ms: 1.0,
                planner_uses_indexes: true,
                ..Inner::default()
            }),
        }
    }

    pub fn add_table(&self, table: &TableName, rowcount: u64) {
        self.inner.lock().tables.insert(
            table.clone(),
            FakeTable {
                rowcount,
                distinct: BTreeMap::new(),
            },
        );
    }

    pub fn add_schema_entry(&self, entry: CatalogEntry) {
        let mut inner = self.inner.lock();
        if !inner.tables.contains_key(&entry.table) {
            inner.tables.insert(entry.table.clone(), FakeTable::default());
        }
        inner.schema.push(entry);
    }

    pub fn set_distinct(&self, table: &TableName, column: &ColumnName, distinct: u64) {
        if let Some(t) = self.inner.lock().tables.get_mut(table) {
            t.distinct.insert(column.clone(), distinct);
        }
    }

    pub fn add_live_index(&self, index: LiveIndex) {
        self.inner.lock().indexes.insert(index.name.clone(), index);
    }

    pub fn set_index_usage(
        &self,
        index: &IndexName,
        scan_count: u64,
        last_used: Option<DateTime<Utc>>,
    ) {
        if let Some(ix) = self.inner.lock().indexes.get_mut(index) {
            ix.scan_count = scan_count;
            ix.last_used = last_used;
        }
    }

    pub fn set_bloat(&self, index: &IndexName, bloat_fraction: f64) {
        if let Some(ix) = self.inner.lock().indexes.get_mut(index) {
            ix.bloat_fraction = bloat_fraction;
        }
    }

    pub fn set_write_latency_ms(&self, latency: f64) {
        self.inner.lock().write_latency_ms = latency;
    }

    pub fn set_planner_uses_indexes(&self, enabled: bool) {
        self.inner.lock().planner_uses_indexes = enabled;
    }

    /// The next `n` explain calls fail, for planner failure accounting tests.
    pub fn fail_next_explains(&self, n: u32) {
        self.inner.lock().explain_failures_remaining = n;
    }

    pub fn push_ddl_script(&self, scripted: ScriptedDdl) {
        self.inner.lock().scripted_ddl.push_back(scripted);
    }

    pub fn push_rows(&self, rows: RowSet) {
        self.inner.lock().scripted_rows.push_back(rows);
    }

    pub fn set_analyze_age(&self, table: &TableName, age: Duration) {
        self.inner.lock().analyze_ages.insert(table.clone(), age);
    }

    pub fn set_stale_locks(&self, count: u64) {
        self.inner.lock().stale_locks = count;
    }

    pub fn set_sample_values(&self, table: &TableName, column: &ColumnName, values: Vec<SqlValue>) {
        self.inner
            .lock()
            .samples
            .insert((table.clone(), column.clone()), values);
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.inner.lock().exec_log.clone()
    }

    pub fn ddl_log(&self) -> Vec<String> {
        self.inner.lock().ddl_log.clone()
    }

    pub fn maintenance_log(&self) -> Vec<(MaintenanceOp, TableName)> {
        self.inner.lock().maintenance_log.clone()
    }

    pub fn cancelled_builds(&self) -> Vec<IndexName> {
        self.inner.lock().cancelled_builds.clone()
    }

    pub fn explain_calls(&self) -> u64 {
        self.inner.lock().explain_calls
    }

    pub fn live_index_names(&self) -> Vec<IndexName> {
        self.inner.lock().indexes.keys().cloned().collect()
    }

    fn table_of(sql: &str) -> Option<String> {
        let mut tokens = sql.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok.eq_ignore_ascii_case("from") || tok.eq_ignore_ascii_case("update") {
                return tokens
                    .next()
                    .map(|t| t.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_'))
                    .map(str::to_owned);
            }
        }
        None
    }

    /// Pick the valid index whose leading column appears in the WHERE clause,
    /// preferring longer matching prefixes.
    fn choose_index(inner: &Inner, table: &str, sql_lower: &str) -> Option<LiveIndex> {
        let where_clause = sql_lower.split_once(" where ").map(|(_, w)| w.to_owned())?;
        let mut best: Option<(usize, LiveIndex)> = None;
        for ix in inner.indexes.values() {
            if !ix.valid || &*ix.table != table {
                continue;
            }
            let matching = ix
                .columns
                .iter()
                .take_while(|c| where_clause.contains(&c.to_lowercase()))
                .count();
            if matching == 0 {
                continue;
            }
            let better = match &best {
                Some((n, _)) => matching > *n,
                None => true,
            };
            if better {
                best = Some((matching, ix.clone()));
            }
        }
        best.map(|(_, ix)| ix)
    }
}

#[async_trait]
impl DbAdapter for FakeDb {
    async fn exec(&self, sql: &str, _params: &[SqlValue]) -> anyhow::Result<ExecResult> {
        let mut inner = self.inner.lock();
        inner.exec_log.push(sql.to_owned());
        if sql.trim_start().to_ascii_lowercase().starts_with("select") {
            let rows = inner.scripted_rows.pop_front().unwrap_or_default();
            return Ok(ExecResult::Rows(rows));
        }
        Ok(ExecResult::Affected(1))
    }

    async fn explain(&self, sql: &str, _params: &[SqlValue], analyze: bool) -> anyhow::Result<Plan> {
        let mut inner = self.inner.lock();
        inner.explain_calls += 1;
        if inner.explain_failures_remaining > 0 {
            inner.explain_failures_remaining -= 1;
            anyhow::bail!(errors::ErrorMetadata::planner_unavailable(
                "scripted explain failure"
            ));
        }
        let sql_lower = sql.to_ascii_lowercase();
        let table = Self::table_of(&sql_lower).unwrap_or_default();
        let rowcount = inner
            .tables
            .get(&table.parse::<TableName>().unwrap_or_else(|_| "t".parse().unwrap()))
            .map(|t| t.rowcount)
            .unwrap_or(0);
        let seq_cost = (rowcount as f64).max(1.0);
        let chosen = if inner.planner_uses_indexes {
            Self::choose_index(&inner, &table, &sql_lower)
        } else {
            None
        };
        let root = match chosen {
            Some(ix) => PlanNode {
                node_type: "Index Scan".to_owned(),
                total_cost: (seq_cost / 1000.0).max(1.0),
                plan_rows: (rowcount as f64 / 100.0).max(1.0),
                actual_rows: analyze.then_some((rowcount as f64 / 100.0).max(1.0)),
                relation: Some(table),
                index_name: Some(ix.name.to_string()),
                children: Vec::new(),
            },
            None => PlanNode {
                node_type: "Seq Scan".to_owned(),
                total_cost: seq_cost,
                plan_rows: rowcount as f64,
                actual_rows: analyze.then_some(rowcount as f64),
                relation: Some(table),
                index_name: None,
                children: Vec::new(),
            },
        };
        Ok(Plan {
            root,
            planning_time_ms: Some(0.1),
            execution_time_ms: analyze.then_some(1.0),
        })
    }

    async fn create_index(
        &self,
        definition: &IndexDefinition,
        non_blocking: bool,
    ) -> anyhow::Result<DdlOutcome> {
        let mut inner = self.inner.lock();
        inner.ddl_log.push(format!(
            "CREATE INDEX{} {} ON {} USING {} ({})",
            if non_blocking { " CONCURRENTLY" } else { "" },
            definition.name,
            definition.table,
            definition.method.sql_method(),
            definition
                .columns
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ));
        let outcome = match inner.scripted_ddl.pop_front() {
            Some(ScriptedDdl::Error(e)) => return Err(anyhow::anyhow!(e)),
            Some(ScriptedDdl::Outcome(outcome)) => outcome,
            None => DdlOutcome::Committed,
        };
        if matches!(outcome, DdlOutcome::Committed | DdlOutcome::FailedInvalid) {
            let rowcount = inner
                .tables
                .get(&definition.table)
                .map(|t| t.rowcount)
                .unwrap_or(0);
            inner.indexes.insert(
                definition.name.clone(),
                LiveIndex {
                    name: definition.name.clone(),
                    table: definition.table.clone(),
                    columns: definition.columns.clone(),
                    predicate: definition.predicate.clone(),
                    method: definition.method,
                    size_bytes: rowcount * 32,
                    scan_count: 0,
                    last_used: None,
                    bloat_fraction: 0.0,
                    valid: outcome == DdlOutcome::Committed,
                    created_by: None,
                },
            );
        }
        Ok(outcome)
    }

    async fn drop_index(&self, index: &IndexName) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.ddl_log.push(format!("DROP INDEX {index}"));
        inner.indexes.remove(index);
        Ok(())
    }

    async fn introspect_schema(&self) -> anyhow::Result<Vec<CatalogEntry>> {
        Ok(self.inner.lock().schema.clone())
    }

    async fn introspect_indexes(
        &self,
        table: Option<&TableName>,
    ) -> anyhow::Result<Vec<LiveIndex>> {
        Ok(self
            .inner
            .lock()
            .indexes
            .values()
            .filter(|ix| table.is_none_or(|t| &ix.table == t))
            .cloned()
            .collect())
    }

    async fn sample_values(
        &self,
        table: &TableName,
        column: &ColumnName,
        n: usize,
    ) -> anyhow::Result<Vec<SqlValue>> {
        let inner = self.inner.lock();
        if let Some(values) = inner.samples.get(&(table.clone(), column.clone())) {
            return Ok(values.iter().take(n).cloned().collect());
        }
        Ok((0..n as i64).map(SqlValue::Int).collect())
    }

    async fn table_rowcount(&self, table: &TableName) -> anyhow::Result<u64> {
        Ok(self.inner.lock().tables.get(table).map(|t| t.rowcount).unwrap_or(0))
    }

    async fn distinct_estimate(
        &self,
        table: &TableName,
        column: &ColumnName,
    ) -> anyhow::Result<u64> {
        let inner = self.inner.lock();
        let t = inner.tables.get(table);
        Ok(t.and_then(|t| t.distinct.get(column).copied())
            .unwrap_or_else(|| t.map(|t| t.rowcount / 10).unwrap_or(0).max(1)))
    }

    async fn write_latency_ms(&self) -> anyhow::Result<f64> {
        Ok(self.inner.lock().write_latency_ms)
    }

    async fn maintenance(&self, op: MaintenanceOp, table: &TableName) -> anyhow::Result<()> {
        self.inner.lock().maintenance_log.push((op, table.clone()));
        Ok(())
    }

    async fn cancel_index_build(&self, index: &IndexName) -> anyhow::Result<()> {
        self.inner.lock().cancelled_builds.push(index.clone());
        Ok(())
    }

    async fn last_analyze_ages(&self) -> anyhow::Result<BTreeMap<TableName, Duration>> {
        Ok(self.inner.lock().analyze_ages.clone())
    }

    async fn release_stale_advisory_locks(&self, _older_than: Duration) -> anyhow::Result<u64> {
        Ok(std::mem::take(&mut self.inner.lock().stale_locks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexMethod;

    fn definition() -> IndexDefinition {
        IndexDefinition {
            name: "ix_contacts_email".parse().unwrap(),
            table: "contacts".parse().unwrap(),
            columns: vec!["email".parse().unwrap()],
            predicate: None,
            method: IndexMethod::Ordered,
        }
    }

    #[tokio::test]
    async fn test_planner_adopts_created_index() {
        let db = FakeDb::new();
        let table: TableName = "contacts".parse().unwrap();
        db.add_table(&table, 100_000);

        let sql = "select * from contacts where email = ?";
        let before = db.explain(sql, &[], false).await.unwrap();
        assert!(before.seq_scans("contacts"));

        db.create_index(&definition(), true).await.unwrap();
        let after = db.explain(sql, &[], false).await.unwrap();
        assert!(after.uses_index("ix_contacts_email"));
        assert!(after.total_cost() < before.total_cost());
    }

    #[tokio::test]
    async fn test_scripted_ddl_failure_leaves_invalid_index() {
        let db = FakeDb::new();
        db.add_table(&"contacts".parse().unwrap(), 1_000);
        db.push_ddl_script(ScriptedDdl::Outcome(DdlOutcome::FailedInvalid));
        let outcome = db.create_index(&definition(), true).await.unwrap();
        assert_eq!(outcome, DdlOutcome::FailedInvalid);
        let indexes = db.introspect_indexes(None).await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(!indexes[0].valid);
    }
}
