//! Core entity types shared across subsystems.
use std::fmt;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::identifier::{
    ColumnName,
    IndexName,
    TableName,
};

/// Opaque tenant identifier. The global sentinel stands in when multi-tenant
/// analysis is disabled.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn global() -> Self {
        Self("_global".to_owned())
    }

    pub fn is_global(&self) -> bool {
        self.0 == "_global"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Strictly monotonic id allocated by the mutation log writer.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl MutationId {
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Index methods the daemon is allowed to emit. Anything else the database
/// supports is out of bounds; a rejected hint falls back to `Ordered`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMethod {
    Ordered,
    Hash,
    Fulltext,
    Geo,
    Brin,
}

impl IndexMethod {
    /// The `USING` clause spelling.
    pub fn sql_method(&self) -> &'static str {
        match self {
            IndexMethod::Ordered => "btree",
            IndexMethod::Hash => "hash",
            IndexMethod::Fulltext => "gin",
            IndexMethod::Geo => "gist",
            IndexMethod::Brin => "brin",
        }
    }

    pub fn from_sql_method(s: &str) -> Option<Self> {
        match s {
            "btree" => Some(IndexMethod::Ordered),
            "hash" => Some(IndexMethod::Hash),
            "gin" => Some(IndexMethod::Fulltext),
            "gist" => Some(IndexMethod::Geo),
            "brin" => Some(IndexMethod::Brin),
            _ => None,
        }
    }

    /// Relative build expense versus an ordered index.
    pub fn build_multiplier(&self) -> f64 {
        match self {
            IndexMethod::Ordered => 1.0,
            IndexMethod::Hash => 0.8,
            IndexMethod::Fulltext => 2.5,
            IndexMethod::Geo => 2.0,
            IndexMethod::Brin => 0.2,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInt,
    Text,
    Boolean,
    Timestamp,
    Uuid,
    Json,
    Bytes,
    Float,
    Numeric,
    Geometry,
    TsVector,
    Other(String),
}

impl ColumnType {
    pub fn from_pg_typname(t: &str) -> Self {
        match t {
            "int2" | "int4" | "integer" | "smallint" => ColumnType::Integer,
            "int8" | "bigint" | "bigserial" | "serial" => ColumnType::BigInt,
            "text" | "varchar" | "character varying" | "char" | "bpchar" | "citext" => {
                ColumnType::Text
            },
            "bool" | "boolean" => ColumnType::Boolean,
            "timestamp" | "timestamptz" | "date" | "time" => ColumnType::Timestamp,
            "uuid" => ColumnType::Uuid,
            "json" | "jsonb" => ColumnType::Json,
            "bytea" => ColumnType::Bytes,
            "float4" | "float8" | "real" | "double precision" => ColumnType::Float,
            "numeric" | "decimal" => ColumnType::Numeric,
            "geometry" | "geography" | "point" => ColumnType::Geometry,
            "tsvector" => ColumnType::TsVector,
            other => ColumnType::Other(other.to_owned()),
        }
    }

    /// Relative per-row cost of indexing this type.
    pub fn build_multiplier(&self) -> f64 {
        match self {
            ColumnType::Integer | ColumnType::BigInt | ColumnType::Boolean => 1.0,
            ColumnType::Timestamp | ColumnType::Float | ColumnType::Uuid => 1.1,
            ColumnType::Numeric => 1.3,
            ColumnType::Text => 1.5,
            ColumnType::Json | ColumnType::Bytes => 2.5,
            ColumnType::Geometry | ColumnType::TsVector => 3.0,
            ColumnType::Other(_) => 1.5,
        }
    }

    /// The natural index method for this type, absent stronger signals.
    pub fn preferred_method(&self) -> IndexMethod {
        match self {
            ColumnType::Geometry => IndexMethod::Geo,
            ColumnType::TsVector => IndexMethod::Fulltext,
            _ => IndexMethod::Ordered,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    None,
    PrimaryKey,
    Unique,
    ForeignKey {
        target_table: TableName,
        target_column: ColumnName,
    },
}

/// One row of the genome: a (table, column) pair with its declared shape.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub table: TableName,
    pub column: ColumnName,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub constraint: Constraint,
}

impl CatalogEntry {
    pub fn key(&self) -> CatalogKey {
        CatalogKey {
            table: self.table.clone(),
            column: self.column.clone(),
        }
    }
}

/// The unique key of a catalog entry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct CatalogKey {
    pub table: TableName,
    pub column: ColumnName,
}

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Normalized SQL text used to aggregate equivalent statements.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFingerprint(String);

impl QueryFingerprint {
    /// Wrap already-normalized text. Normalization itself lives in the query
    /// stats store.
    pub fn from_normalized(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// An index present in the database, as seen by introspection plus the usage
/// statistics views.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveIndex {
    pub name: IndexName,
    pub table: TableName,
    pub columns: Vec<ColumnName>,
    pub predicate: Option<String>,
    pub method: IndexMethod,
    pub size_bytes: u64,
    pub scan_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub bloat_fraction: f64,
    pub valid: bool,
    pub created_by: Option<MutationId>,
}

impl LiveIndex {
    /// Prefix dominance: this index dominates `columns` when its own column
    /// list starts with all of `columns`, under the same predicate and
    /// method.
    pub fn prefix_dominates(
        &self,
        columns: &[ColumnName],
        predicate: Option<&str>,
        method: IndexMethod,
    ) -> bool {
        self.method == method
            && self.predicate.as_deref() == predicate
            && self.columns.len() >= columns.len()
            && self.columns[..columns.len()] == *columns
    }
}

/// A proposed index, scored and carrying the evidence that produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexCandidate {
    pub tenant: TenantId,
    pub table: TableName,
    pub columns: Vec<ColumnName>,
    pub predicate: Option<String>,
    pub expression: Option<String>,
    pub method: IndexMethod,
    pub build_cost: f64,
    pub benefit: f64,
    pub score: f64,
    pub size_estimate_bytes: u64,
    /// Snapshot of the stats and costs behind the score, for the log.
    pub rationale: JsonValue,
    pub motivating_fingerprints: Vec<QueryFingerprint>,
    /// An existing index this candidate prefix-dominates; dropped only after
    /// the candidate commits.
    pub paired_drop: Option<IndexName>,
}

impl IndexCandidate {
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Everything the executor needs to emit one `CREATE INDEX`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: IndexName,
    pub table: TableName,
    pub columns: Vec<ColumnName>,
    pub predicate: Option<String>,
    pub method: IndexMethod,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationAction {
    Propose,
    Create,
    CreateFailed,
    Commit,
    Drop,
    Rebuild,
    RebuildFailed,
    Rollback,
    CatalogChange,
    SpikeSuppressed,
    Deferred,
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationAction::Propose => "PROPOSE",
            MutationAction::Create => "CREATE",
            MutationAction::CreateFailed => "CREATE_FAILED",
            MutationAction::Commit => "COMMIT",
            MutationAction::Drop => "DROP",
            MutationAction::Rebuild => "REBUILD",
            MutationAction::RebuildFailed => "REBUILD_FAILED",
            MutationAction::Rollback => "ROLLBACK",
            MutationAction::CatalogChange => "CATALOG_CHANGE",
            MutationAction::SpikeSuppressed => "SPIKE_SUPPRESSED",
            MutationAction::Deferred => "DEFERRED",
        };
        f.write_str(s)
    }
}

/// One record of the append-only mutation log. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub ts: DateTime<Utc>,
    pub tenant: Option<TenantId>,
    pub action: MutationAction,
    pub table: Option<TableName>,
    pub index: Option<IndexName>,
    /// Rationale snapshot: scores, stats, and gate outcomes at decision time.
    pub details: JsonValue,
    /// The mutation this one supersedes (REBUILD, ROLLBACK) or follows
    /// (COMMIT after CREATE).
    pub prev_mid: Option<MutationId>,
}

/// Per-table read/write activity over the sampling window.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TableActivity {
    pub reads: u64,
    pub writes: u64,
}

impl TableActivity {
    pub fn read_ratio(&self) -> f64 {
        let total = self.reads + self.writes;
        if total == 0 {
            // Nothing observed: treat as balanced.
            return 0.5;
        }
        self.reads as f64 / total as f64
    }
}
