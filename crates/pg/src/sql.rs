//! Statement text for the Postgres adapter. Metadata-table bootstrap runs on
//! every daemon start, so each statement is idempotent and touches no
//! resident data.

/// The five metadata tables. `IF NOT EXISTS` keeps re-bootstrap cheap; the
/// catalog diff happens at a higher layer.
pub(crate) const INIT_SQL: &[&str] = &[
    r"
CREATE TABLE IF NOT EXISTS indexpilot_catalog_entry (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    column_type TEXT NOT NULL,
    nullable BOOLEAN NOT NULL,
    constraint_info JSONB NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (table_name, column_name)
)",
    r"
CREATE TABLE IF NOT EXISTS indexpilot_expression_profile (
    tenant TEXT NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT true,
    PRIMARY KEY (tenant, table_name, column_name)
)",
    r"
CREATE TABLE IF NOT EXISTS indexpilot_query_stat (
    tenant TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    count BIGINT NOT NULL,
    ewma_duration_ms DOUBLE PRECISION NOT NULL,
    p95_ms DOUBLE PRECISION NOT NULL,
    first_seen TIMESTAMPTZ NOT NULL,
    last_seen TIMESTAMPTZ NOT NULL,
    columns_read JSONB NOT NULL DEFAULT '[]'::jsonb,
    PRIMARY KEY (tenant, fingerprint)
)",
    r"
CREATE TABLE IF NOT EXISTS indexpilot_mutation_log (
    mid BIGINT PRIMARY KEY,
    ts TIMESTAMPTZ NOT NULL,
    tenant TEXT,
    action TEXT NOT NULL,
    target_table TEXT,
    target_index TEXT,
    details JSONB NOT NULL DEFAULT '{}'::jsonb,
    prev_mid BIGINT
)",
    r"
CREATE TABLE IF NOT EXISTS indexpilot_query_sample (
    tenant TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    duration_ms DOUBLE PRECISION NOT NULL,
    ts TIMESTAMPTZ NOT NULL
)",
    r"
CREATE INDEX IF NOT EXISTS indexpilot_query_sample_by_ts ON indexpilot_query_sample (ts)",
];

/// All user tables and columns with their single most relevant constraint.
pub(crate) const INTROSPECT_SCHEMA_SQL: &str = r"
SELECT
    c.relname AS table_name,
    a.attname AS column_name,
    t.typname AS column_type,
    NOT a.attnotnull AS nullable,
    COALESCE(con.contype::text, '') AS contype,
    ft.relname AS fk_table,
    fa.attname AS fk_column
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
JOIN pg_type t ON t.oid = a.atttypid
LEFT JOIN pg_constraint con
    ON con.conrelid = c.oid
    AND a.attnum = ANY (con.conkey)
    AND con.contype IN ('p', 'u', 'f')
LEFT JOIN pg_class ft ON ft.oid = con.confrelid
LEFT JOIN pg_attribute fa ON fa.attrelid = con.confrelid AND fa.attnum = con.confkey[1]
WHERE c.relkind = 'r'
    AND n.nspname NOT IN ('pg_catalog', 'information_schema')
    AND c.relname NOT LIKE 'indexpilot_%'
ORDER BY c.relname, a.attnum";

/// Live indexes with usage statistics, size, validity, and a dead-tuple
/// ratio of the parent table standing in for a bloat estimate.
/// `last_idx_scan` needs Postgres 16; older servers report NULL.
pub(crate) const INTROSPECT_INDEXES_SQL: &str = r"
SELECT
    i.relname AS index_name,
    c.relname AS table_name,
    am.amname AS method,
    idx.indisvalid AS valid,
    pg_relation_size(i.oid)::bigint AS size_bytes,
    COALESCE(s.idx_scan, 0)::bigint AS scan_count,
    extract(epoch FROM s.last_idx_scan)::float8 AS last_used_epoch,
    pg_get_expr(idx.indpred, idx.indrelid) AS predicate,
    (
        SELECT COALESCE(string_agg(a.attname, ',' ORDER BY ord.k), '')
        FROM unnest(idx.indkey) WITH ORDINALITY AS ord(attnum, k)
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ord.attnum
    ) AS column_list,
    COALESCE(
        ts.n_dead_tup::float8 / NULLIF(ts.n_live_tup + ts.n_dead_tup, 0)::float8,
        0.0
    ) AS bloat_fraction
FROM pg_index idx
JOIN pg_class i ON i.oid = idx.indexrelid
JOIN pg_class c ON c.oid = idx.indrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_am am ON am.oid = i.relam
LEFT JOIN pg_stat_user_indexes s ON s.indexrelid = i.oid
LEFT JOIN pg_stat_user_tables ts ON ts.relid = c.oid
WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
    AND NOT idx.indisprimary
    AND c.relname NOT LIKE 'indexpilot_%'
ORDER BY c.relname, i.relname";

/// Block-write time per transaction as the write-latency proxy.
pub(crate) const WRITE_LATENCY_SQL: &str = r"
SELECT COALESCE(blk_write_time / GREATEST(xact_commit + xact_rollback, 1), 0.0)::float8
FROM pg_stat_database
WHERE datname = current_database()";

pub(crate) const LAST_ANALYZE_SQL: &str = r"
SELECT
    relname,
    extract(epoch FROM now() - GREATEST(
        COALESCE(last_analyze, 'epoch'::timestamptz),
        COALESCE(last_autoanalyze, 'epoch'::timestamptz)
    ))::float8 AS age_secs
FROM pg_stat_user_tables
WHERE relname NOT LIKE 'indexpilot_%'";

pub(crate) const ROWCOUNT_SQL: &str = r"
SELECT GREATEST(reltuples, 0)::bigint FROM pg_class WHERE relname = $1";

/// `n_distinct` is negative when the planner tracks it as a fraction of the
/// rowcount.
pub(crate) const DISTINCT_SQL: &str = r"
SELECT s.n_distinct::float8, GREATEST(c.reltuples, 0)::float8
FROM pg_stats s
JOIN pg_class c ON c.relname = s.tablename
WHERE s.tablename = $1 AND s.attname = $2";

/// Sessions idle beyond the threshold while holding advisory locks.
pub(crate) const STALE_ADVISORY_LOCKS_SQL: &str = r"
SELECT pg_terminate_backend(a.pid)
FROM pg_locks l
JOIN pg_stat_activity a ON a.pid = l.pid
WHERE l.locktype = 'advisory'
    AND l.granted
    AND a.state = 'idle'
    AND a.state_change < now() - make_interval(secs => $1)";

pub(crate) const CANCEL_INDEX_BUILD_SQL: &str = r"
SELECT pg_cancel_backend(pid)
FROM pg_stat_activity
WHERE query ILIKE 'CREATE INDEX%' AND query LIKE '%' || $1 || '%'";
