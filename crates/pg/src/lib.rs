//! Postgres implementation of the database adapter.
//!
//! This crate owns everything that touches the wire: the bounded connection
//! pool, parameter/row conversion, DDL assembly from validated identifiers,
//! catalog and index introspection, and the capacity-1 semaphore that
//! serializes VACUUM/ANALYZE/REINDEX across the platform. It performs no
//! retries and no policy; failures are classified and surfaced.
mod connection;
mod metrics;
mod sql;
#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::DateTime;
use common::{
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
    knobs::{
        LOCK_TIMEOUT,
        LONG_DDL_TIMEOUT,
        POOL_MAX,
        STATEMENT_TIMEOUT,
    },
    plan::Plan,
    types::{
        CatalogEntry,
        ColumnType,
        Constraint,
        IndexDefinition,
        IndexMethod,
        LiveIndex,
    },
};
use errors::ErrorMetadata;
use tokio::sync::Semaphore;
use tokio_postgres::{
    error::SqlState,
    types::{
        to_sql_checked,
        IsNull,
        ToSql,
        Type,
    },
    Row,
};

use crate::{
    connection::ConnectionPool,
    metrics::{
        log_ddl,
        query_timer,
    },
};

pub struct PostgresAdapter {
    pool: Arc<ConnectionPool>,
    maintenance_semaphore: Semaphore,
}

impl PostgresAdapter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            pool: ConnectionPool::new(url.into(), *POOL_MAX),
            maintenance_semaphore: Semaphore::new(1),
        }
    }

    /// Create the metadata tables. Idempotent; safe to run on every boot.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        for statement in sql::INIT_SQL {
            conn.batch_execute(statement).await.map_err(classify_error)?;
        }
        Ok(())
    }

    async fn query_rows(&self, sql: &str, params: &[SqlValue]) -> anyhow::Result<Vec<Row>> {
        let _timer = query_timer();
        let mut conn = self.pool.acquire().await?;
        let pg_params: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        tokio::time::timeout(*STATEMENT_TIMEOUT, conn.query(sql, &refs))
            .await
            .map_err(|_| anyhow::anyhow!(ErrorMetadata::timeout("statement timed out")))?
            .map_err(classify_error)
    }
}

/// Wraps a [`SqlValue`] for the tokio-postgres parameter machinery. Statement
/// text casts parameters where a non-scalar type is expected, so only the
/// scalar encodings below are ever required.
#[derive(Debug)]
struct PgParam<'a>(&'a SqlValue);

impl ToSql for PgParam<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self.0 {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => v.to_sql(ty, out),
            SqlValue::Float(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn row_to_values(row: &Row) -> Vec<SqlValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let value = match *col.type_() {
                Type::BOOL => row.try_get::<_, Option<bool>>(i).ok().flatten().map(SqlValue::Bool),
                Type::INT2 => row
                    .try_get::<_, Option<i16>>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Int(v as i64)),
                Type::INT4 => row
                    .try_get::<_, Option<i32>>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Int(v as i64)),
                Type::INT8 => row.try_get::<_, Option<i64>>(i).ok().flatten().map(SqlValue::Int),
                Type::FLOAT4 => row
                    .try_get::<_, Option<f32>>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Float(v as f64)),
                Type::FLOAT8 => {
                    row.try_get::<_, Option<f64>>(i).ok().flatten().map(SqlValue::Float)
                },
                Type::BYTEA => {
                    row.try_get::<_, Option<Vec<u8>>>(i).ok().flatten().map(SqlValue::Bytes)
                },
                Type::JSON | Type::JSONB => row
                    .try_get::<_, Option<serde_json::Value>>(i)
                    .ok()
                    .flatten()
                    .map(SqlValue::Json),
                _ => row.try_get::<_, Option<String>>(i).ok().flatten().map(SqlValue::Text),
            };
            value.unwrap_or(SqlValue::Null)
        })
        .collect()
}

fn rows_to_rowset(rows: &[Row]) -> RowSet {
    let columns = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_owned()).collect())
        .unwrap_or_default();
    RowSet {
        columns,
        rows: rows.iter().map(row_to_values).collect(),
    }
}

/// Map a driver error onto the adapter's failure taxonomy.
pub(crate) fn classify_error(e: anyhow::Error) -> anyhow::Error {
    let Some(pg_err) = e.downcast_ref::<tokio_postgres::Error>() else {
        return e;
    };
    let Some(code) = pg_err.code() else {
        return e.context(ErrorMetadata::connection_lost("connection failed mid-statement"));
    };
    let metadata = if *code == SqlState::LOCK_NOT_AVAILABLE {
        ErrorMetadata::lock_timeout("lock acquisition timed out")
    } else if *code == SqlState::T_R_DEADLOCK_DETECTED {
        ErrorMetadata::deadlock("deadlock detected")
    } else if *code == SqlState::QUERY_CANCELED {
        ErrorMetadata::timeout("statement canceled")
    } else if *code == SqlState::INSUFFICIENT_PRIVILEGE {
        ErrorMetadata::permission_denied("insufficient database privileges")
    } else if *code == SqlState::DUPLICATE_TABLE || *code == SqlState::DUPLICATE_OBJECT {
        ErrorMetadata::ddl_conflict("object already exists")
    } else if *code == SqlState::UNDEFINED_TABLE {
        ErrorMetadata::unknown_table("relation does not exist")
    } else {
        return e;
    };
    e.context(metadata)
}

fn build_create_index_sql(definition: &IndexDefinition, non_blocking: bool) -> String {
    let columns = definition
        .columns
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let mut statement = format!(
        "CREATE INDEX {concurrently}{name} ON {table} USING {method} ({columns})",
        concurrently = if non_blocking { "CONCURRENTLY " } else { "" },
        name = definition.name,
        table = definition.table,
        method = definition.method.sql_method(),
    );
    if let Some(predicate) = &definition.predicate {
        statement.push_str(" WHERE ");
        statement.push_str(predicate);
    }
    statement
}

fn parse_live_index(row: &RowSet, i: usize) -> anyhow::Result<Option<LiveIndex>> {
    let name: IndexName = match row.get(i, "index_name").and_then(SqlValue::as_str) {
        Some(s) => match s.parse() {
            Ok(name) => name,
            // Indexes with names we would never emit are invisible to us.
            Err(_) => return Ok(None),
        },
        None => return Ok(None),
    };
    let table: TableName = match row.get(i, "table_name").and_then(SqlValue::as_str) {
        Some(s) => match s.parse() {
            Ok(t) => t,
            Err(_) => return Ok(None),
        },
        None => return Ok(None),
    };
    let mut columns = Vec::new();
    if let Some(list) = row.get(i, "column_list").and_then(SqlValue::as_str) {
        for part in list.split(',').filter(|p| !p.is_empty()) {
            match part.parse::<ColumnName>() {
                Ok(c) => columns.push(c),
                // Expression indexes surface non-identifier terms.
                Err(_) => return Ok(None),
            }
        }
    }
    let method = row
        .get(i, "method")
        .and_then(SqlValue::as_str)
        .and_then(IndexMethod::from_sql_method)
        .unwrap_or(IndexMethod::Ordered);
    Ok(Some(LiveIndex {
        name,
        table,
        columns,
        predicate: row
            .get(i, "predicate")
            .and_then(SqlValue::as_str)
            .map(str::to_owned),
        method,
        size_bytes: row.get(i, "size_bytes").and_then(SqlValue::as_i64).unwrap_or(0) as u64,
        scan_count: row.get(i, "scan_count").and_then(SqlValue::as_i64).unwrap_or(0) as u64,
        last_used: row
            .get(i, "last_used_epoch")
            .and_then(SqlValue::as_f64)
            .and_then(|epoch| DateTime::from_timestamp(epoch as i64, 0)),
        bloat_fraction: row
            .get(i, "bloat_fraction")
            .and_then(SqlValue::as_f64)
            .unwrap_or(0.0),
        valid: matches!(row.get(i, "valid"), Some(SqlValue::Bool(true))),
        created_by: None,
    }))
}

fn parse_catalog_entry(row: &RowSet, i: usize) -> Option<CatalogEntry> {
    let table: TableName = row.get(i, "table_name")?.as_str()?.parse().ok()?;
    let column: ColumnName = row.get(i, "column_name")?.as_str()?.parse().ok()?;
    let column_type =
        ColumnType::from_pg_typname(row.get(i, "column_type")?.as_str().unwrap_or(""));
    let nullable = matches!(row.get(i, "nullable"), Some(SqlValue::Bool(true)));
    let constraint = match row.get(i, "contype").and_then(SqlValue::as_str) {
        Some("p") => Constraint::PrimaryKey,
        Some("u") => Constraint::Unique,
        Some("f") => {
            let target_table = row.get(i, "fk_table").and_then(SqlValue::as_str)?.parse().ok()?;
            let target_column =
                row.get(i, "fk_column").and_then(SqlValue::as_str)?.parse().ok()?;
            Constraint::ForeignKey {
                target_table,
                target_column,
            }
        },
        _ => Constraint::None,
    };
    Some(CatalogEntry {
        table,
        column,
        column_type,
        nullable,
        constraint,
    })
}

#[async_trait]
impl DbAdapter for PostgresAdapter {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> anyhow::Result<ExecResult> {
        let trimmed = sql.trim_start().to_ascii_lowercase();
        if trimmed.starts_with("select") || trimmed.starts_with("with") {
            let rows = self.query_rows(sql, params).await?;
            return Ok(ExecResult::Rows(rows_to_rowset(&rows)));
        }
        let _timer = query_timer();
        let mut conn = self.pool.acquire().await?;
        let pg_params: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let affected = tokio::time::timeout(*STATEMENT_TIMEOUT, conn.execute(sql, &refs))
            .await
            .map_err(|_| anyhow::anyhow!(ErrorMetadata::timeout("statement timed out")))?
            .map_err(classify_error)?;
        Ok(ExecResult::Affected(affected))
    }

    async fn explain(&self, sql: &str, params: &[SqlValue], analyze: bool) -> anyhow::Result<Plan> {
        let statement = format!(
            "EXPLAIN (FORMAT JSON{analyze}) {sql}",
            analyze = if analyze { ", ANALYZE" } else { "" },
        );
        let rows = self.query_rows(&statement, params).await.map_err(|e| {
            e.context(ErrorMetadata::planner_unavailable("EXPLAIN failed"))
        })?;
        let raw: serde_json::Value = rows
            .first()
            .ok_or_else(|| anyhow::anyhow!(ErrorMetadata::planner_unavailable(
                "EXPLAIN returned no rows"
            )))?
            .try_get(0)?;
        Plan::from_explain_json(&raw)
    }

    async fn create_index(
        &self,
        definition: &IndexDefinition,
        non_blocking: bool,
    ) -> anyhow::Result<DdlOutcome> {
        log_ddl("create_index");
        let statement = build_create_index_sql(definition, non_blocking);
        let timeout = if non_blocking {
            *LONG_DDL_TIMEOUT
        } else {
            *STATEMENT_TIMEOUT
        };
        let mut conn = self.pool.acquire().await?;
        conn.batch_execute(&format!(
            "SET statement_timeout = {}; SET lock_timeout = {}",
            timeout.as_millis(),
            LOCK_TIMEOUT.as_millis(),
        ))
        .await
        .map_err(classify_error)?;
        let result = conn.batch_execute(&statement).await;
        // Restore session defaults before the connection returns to the pool.
        let _ = conn
            .batch_execute("RESET statement_timeout; RESET lock_timeout")
            .await;
        match result {
            Ok(()) => Ok(DdlOutcome::Committed),
            Err(e) => {
                let code = e
                    .downcast_ref::<tokio_postgres::Error>()
                    .and_then(|pg| pg.code().cloned());
                if code == Some(SqlState::LOCK_NOT_AVAILABLE) {
                    Ok(DdlOutcome::LockTimeout)
                } else if code == Some(SqlState::QUERY_CANCELED) && non_blocking {
                    // A canceled concurrent build leaves an invalid index
                    // behind for the integrity sweep.
                    Ok(DdlOutcome::FailedInvalid)
                } else {
                    Err(classify_error(e))
                }
            },
        }
    }

    async fn drop_index(&self, index: &IndexName) -> anyhow::Result<()> {
        log_ddl("drop_index");
        let mut conn = self.pool.acquire().await?;
        conn.batch_execute(&format!("DROP INDEX CONCURRENTLY IF EXISTS {index}"))
            .await
            .map_err(classify_error)
    }

    async fn introspect_schema(&self) -> anyhow::Result<Vec<CatalogEntry>> {
        let rows = self.query_rows(sql::INTROSPECT_SCHEMA_SQL, &[]).await?;
        let rowset = rows_to_rowset(&rows);
        Ok((0..rowset.len())
            .filter_map(|i| parse_catalog_entry(&rowset, i))
            .collect())
    }

    async fn introspect_indexes(
        &self,
        table: Option<&TableName>,
    ) -> anyhow::Result<Vec<LiveIndex>> {
        let rows = self.query_rows(sql::INTROSPECT_INDEXES_SQL, &[]).await?;
        let rowset = rows_to_rowset(&rows);
        let mut out = Vec::new();
        for i in 0..rowset.len() {
            if let Some(ix) = parse_live_index(&rowset, i)? {
                if table.is_none_or(|t| &ix.table == t) {
                    out.push(ix);
                }
            }
        }
        Ok(out)
    }

    async fn sample_values(
        &self,
        table: &TableName,
        column: &ColumnName,
        n: usize,
    ) -> anyhow::Result<Vec<SqlValue>> {
        let statement =
            format!("SELECT {column} FROM {table} ORDER BY random() LIMIT {n}");
        let rows = self.query_rows(&statement, &[]).await?;
        Ok(rows.iter().map(|r| row_to_values(r).remove(0)).collect())
    }

    async fn table_rowcount(&self, table: &TableName) -> anyhow::Result<u64> {
        let rows = self
            .query_rows(sql::ROWCOUNT_SQL, &[SqlValue::Text(table.to_string())])
            .await?;
        let rowset = rows_to_rowset(&rows);
        Ok(rowset.rows.first().and_then(|r| r[0].as_i64()).unwrap_or(0) as u64)
    }

    async fn distinct_estimate(
        &self,
        table: &TableName,
        column: &ColumnName,
    ) -> anyhow::Result<u64> {
        let rows = self
            .query_rows(
                sql::DISTINCT_SQL,
                &[
                    SqlValue::Text(table.to_string()),
                    SqlValue::Text(column.to_string()),
                ],
            )
            .await?;
        let rowset = rows_to_rowset(&rows);
        let Some(row) = rowset.rows.first() else {
            return Ok(1);
        };
        let n_distinct = row[0].as_f64().unwrap_or(-0.1);
        let reltuples = row[1].as_f64().unwrap_or(0.0);
        let estimate = if n_distinct >= 0.0 {
            n_distinct
        } else {
            // Negative n_distinct is a fraction of the rowcount.
            -n_distinct * reltuples
        };
        Ok((estimate as u64).max(1))
    }

    async fn write_latency_ms(&self) -> anyhow::Result<f64> {
        let rows = self.query_rows(sql::WRITE_LATENCY_SQL, &[]).await?;
        let rowset = rows_to_rowset(&rows);
        Ok(rowset.rows.first().and_then(|r| r[0].as_f64()).unwrap_or(0.0))
    }

    async fn maintenance(&self, op: MaintenanceOp, table: &TableName) -> anyhow::Result<()> {
        // Concurrent VACUUM/ANALYZE/REINDEX can exhaust shared memory on some
        // platforms; one at a time, platform-wide.
        let _permit = self.maintenance_semaphore.acquire().await?;
        log_ddl(op.verb());
        let statement = match op {
            MaintenanceOp::Vacuum => format!("VACUUM (ANALYZE) {table}"),
            MaintenanceOp::Analyze => format!("ANALYZE {table}"),
            MaintenanceOp::Reindex => format!("REINDEX TABLE CONCURRENTLY {table}"),
        };
        let mut conn = self.pool.acquire().await?;
        conn.batch_execute(&statement).await.map_err(classify_error)
    }

    async fn cancel_index_build(&self, index: &IndexName) -> anyhow::Result<()> {
        self.query_rows(
            sql::CANCEL_INDEX_BUILD_SQL,
            &[SqlValue::Text(index.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn last_analyze_ages(&self) -> anyhow::Result<BTreeMap<TableName, Duration>> {
        let rows = self.query_rows(sql::LAST_ANALYZE_SQL, &[]).await?;
        let rowset = rows_to_rowset(&rows);
        let mut ages = BTreeMap::new();
        for i in 0..rowset.len() {
            let Some(table) = rowset
                .get(i, "relname")
                .and_then(SqlValue::as_str)
                .and_then(|s| s.parse::<TableName>().ok())
            else {
                continue;
            };
            let age_secs = rowset.get(i, "age_secs").and_then(SqlValue::as_f64).unwrap_or(0.0);
            ages.insert(table, Duration::from_secs_f64(age_secs.max(0.0)));
        }
        Ok(ages)
    }

    async fn release_stale_advisory_locks(&self, older_than: Duration) -> anyhow::Result<u64> {
        let rows = self
            .query_rows(
                sql::STALE_ADVISORY_LOCKS_SQL,
                &[SqlValue::Float(older_than.as_secs_f64())],
            )
            .await?;
        Ok(rows.len() as u64)
    }
}
