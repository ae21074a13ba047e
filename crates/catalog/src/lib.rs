//! The catalog ("genome"): the canonical (table, column) schema the daemon
//! watches, plus the per-tenant expression profile over it.
//!
//! Bootstrap either introspects the live database or loads a declarative
//! schema file. Re-bootstrapping is idempotent: the new entry set is diffed
//! against the previous one and only a non-empty diff produces a
//! CATALOG_CHANGE record. All catalog mutations are linearized through a
//! single writer.
mod metrics;
pub mod profile;
pub mod schema_file;

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    db::{
        DbAdapter,
        SqlValue,
    },
    identifier::TableName,
    types::{
        CatalogEntry,
        CatalogKey,
        Constraint,
        MutationAction,
    },
};
use errors::ErrorMetadata;
use mutation_log::{
    MutationLog,
    NewMutation,
};
use parking_lot::RwLock;
use serde_json::json;

pub use crate::{
    profile::ExpressionProfile,
    schema_file::DeclarativeSchema,
};
use crate::metrics::log_catalog_size;

const UPSERT_ENTRY_SQL: &str = "INSERT INTO indexpilot_catalog_entry \
     (table_name, column_name, column_type, nullable, constraint_info) \
     VALUES ($1, $2, $3, $4, $5) \
     ON CONFLICT (table_name, column_name) DO UPDATE SET \
     column_type = EXCLUDED.column_type, nullable = EXCLUDED.nullable, \
     constraint_info = EXCLUDED.constraint_info";

const DELETE_ENTRY_SQL: &str =
    "DELETE FROM indexpilot_catalog_entry WHERE table_name = $1 AND column_name = $2";

#[derive(Clone)]
pub enum BootstrapMode {
    Introspect,
    Declarative(DeclarativeSchema),
}

pub struct Catalog {
    db: Arc<dyn DbAdapter>,
    log: MutationLog,
    entries: RwLock<BTreeMap<CatalogKey, CatalogEntry>>,
    unknown_tables: RwLock<Vec<TableName>>,
    // Serializes bootstrap/refresh; readers go through `entries` directly.
    writer: tokio::sync::Mutex<()>,
}

impl Catalog {
    pub async fn bootstrap(
        db: Arc<dyn DbAdapter>,
        log: MutationLog,
        mode: BootstrapMode,
    ) -> anyhow::Result<Self> {
        let catalog = Self {
            db,
            log,
            entries: RwLock::new(BTreeMap::new()),
            unknown_tables: RwLock::new(Vec::new()),
            writer: tokio::sync::Mutex::new(()),
        };
        catalog.refresh(mode).await?;
        Ok(catalog)
    }

    /// Recompute the catalog from the given mode and apply the diff. Called
    /// at boot and by the schema-evolution detector.
    pub async fn refresh(&self, mode: BootstrapMode) -> anyhow::Result<()> {
        let _writer = self.writer.lock().await;
        let live = self.db.introspect_schema().await?;
        let target = match &mode {
            BootstrapMode::Introspect => live,
            BootstrapMode::Declarative(schema) => {
                let declared = schema.entries()?;
                cross_check_declared(&declared, &live, &self.unknown_tables)?;
                declared
            },
        };
        validate_foreign_keys(&target)?;

        let target_map: BTreeMap<CatalogKey, CatalogEntry> =
            target.into_iter().map(|e| (e.key(), e)).collect();
        let diff = {
            let current = self.entries.read();
            diff_entries(&current, &target_map)
        };
        if diff.is_empty() {
            return Ok(());
        }

        // Log intent before touching persisted state.
        self.log
            .append(NewMutation {
                tenant: None,
                action: MutationAction::CatalogChange,
                table: None,
                index: None,
                details: diff.to_details(),
                prev_mid: None,
            })
            .await?;

        for key in &diff.removed {
            self.db
                .exec(
                    DELETE_ENTRY_SQL,
                    &[
                        SqlValue::Text(key.table.to_string()),
                        SqlValue::Text(key.column.to_string()),
                    ],
                )
                .await?;
        }
        for entry in diff.added.iter().chain(diff.changed.iter()) {
            self.db
                .exec(
                    UPSERT_ENTRY_SQL,
                    &[
                        SqlValue::Text(entry.table.to_string()),
                        SqlValue::Text(entry.column.to_string()),
                        SqlValue::Text(serde_json::to_string(&entry.column_type)?),
                        SqlValue::Bool(entry.nullable),
                        SqlValue::Json(serde_json::to_value(&entry.constraint)?),
                    ],
                )
                .await?;
        }

        *self.entries.write() = target_map;
        log_catalog_size(self.entries.read().len());
        Ok(())
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn entry(&self, key: &CatalogKey) -> Option<CatalogEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn tables(&self) -> Vec<TableName> {
        let mut tables: Vec<TableName> = self
            .entries
            .read()
            .keys()
            .map(|k| k.table.clone())
            .collect();
        tables.dedup();
        tables
    }

    pub fn columns_of(&self, table: &TableName) -> Vec<CatalogEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| &e.table == table)
            .cloned()
            .collect()
    }

    /// Foreign-key entries, the raw material for FK-coverage candidates.
    pub fn foreign_keys(&self) -> Vec<CatalogEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| matches!(e.constraint, Constraint::ForeignKey { .. }))
            .cloned()
            .collect()
    }

    /// Live tables that are not part of the declared catalog. Visible for
    /// health reporting, invisible to the decision engine.
    pub fn unknown_tables(&self) -> Vec<TableName> {
        self.unknown_tables.read().clone()
    }
}

fn cross_check_declared(
    declared: &[CatalogEntry],
    live: &[CatalogEntry],
    unknown_out: &RwLock<Vec<TableName>>,
) -> anyhow::Result<()> {
    let declared_tables: Vec<&TableName> = {
        let mut t: Vec<_> = declared.iter().map(|e| &e.table).collect();
        t.dedup();
        t
    };
    let live_tables: Vec<&TableName> = {
        let mut t: Vec<_> = live.iter().map(|e| &e.table).collect();
        t.dedup();
        t
    };
    for table in &declared_tables {
        if !live_tables.contains(table) {
            anyhow::bail!(ErrorMetadata::unknown_table(format!(
                "declared table {table} does not exist in the database"
            )));
        }
    }
    let mut unknown = Vec::new();
    for table in live_tables {
        if !declared_tables.contains(&table) {
            tracing::warn!("live table {table} is not declared; ignoring it");
            unknown.push(table.clone());
        }
    }
    *unknown_out.write() = unknown;
    Ok(())
}

/// Every foreign key must land on a primary or unique key of its target.
fn validate_foreign_keys(entries: &[CatalogEntry]) -> anyhow::Result<()> {
    for entry in entries {
        let Constraint::ForeignKey {
            target_table,
            target_column,
        } = &entry.constraint
        else {
            continue;
        };
        let target_ok = entries.iter().any(|e| {
            &e.table == target_table
                && &e.column == target_column
                && matches!(e.constraint, Constraint::PrimaryKey | Constraint::Unique)
        });
        if !target_ok {
            anyhow::bail!(ErrorMetadata::malformed_schema(format!(
                "foreign key {} references {target_table}.{target_column}, which is not a \
                 primary or unique key",
                entry.key(),
            )));
        }
    }
    Ok(())
}

struct CatalogDiff {
    added: Vec<CatalogEntry>,
    removed: Vec<CatalogKey>,
    changed: Vec<CatalogEntry>,
}

impl CatalogDiff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    fn to_details(&self) -> serde_json::Value {
        json!({
            "added": self.added.iter().map(|e| e.key().to_string()).collect::<Vec<_>>(),
            "removed": self.removed.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            "changed": self.changed.iter().map(|e| e.key().to_string()).collect::<Vec<_>>(),
        })
    }
}

fn diff_entries(
    current: &BTreeMap<CatalogKey, CatalogEntry>,
    target: &BTreeMap<CatalogKey, CatalogEntry>,
) -> CatalogDiff {
    let mut diff = CatalogDiff {
        added: Vec::new(),
        removed: Vec::new(),
        changed: Vec::new(),
    };
    for (key, entry) in target {
        match current.get(key) {
            None => diff.added.push(entry.clone()),
            Some(existing) if existing != entry => diff.changed.push(entry.clone()),
            Some(_) => {},
        }
    }
    for key in current.keys() {
        if !target.contains_key(key) {
            diff.removed.push(key.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        testing::FakeDb,
        types::{
            CatalogEntry,
            ColumnType,
            Constraint,
            MutationAction,
        },
    };
    use mutation_log::MutationLog;
    use serde_json::json;

    use super::{
        BootstrapMode,
        Catalog,
        DeclarativeSchema,
    };

    fn entry(table: &str, column: &str, constraint: Constraint) -> CatalogEntry {
        CatalogEntry {
            table: table.parse().unwrap(),
            column: column.parse().unwrap(),
            column_type: ColumnType::BigInt,
            nullable: false,
            constraint,
        }
    }

    async fn fixture() -> (Arc<FakeDb>, MutationLog) {
        let db = Arc::new(FakeDb::new());
        db.add_schema_entry(entry("contacts", "id", Constraint::PrimaryKey));
        db.add_schema_entry(entry("contacts", "email", Constraint::None));
        let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
        (db, log)
    }

    #[tokio::test]
    async fn test_introspect_bootstrap_and_idempotent_refresh() {
        let (db, log) = fixture().await;
        let catalog = Catalog::bootstrap(db, log.clone(), BootstrapMode::Introspect)
            .await
            .unwrap();
        assert_eq!(catalog.entries().len(), 2);
        let changes = log.scan(|r| r.action == MutationAction::CatalogChange);
        assert_eq!(changes.len(), 1);

        // Same schema again: no new records, no entry churn.
        catalog.refresh(BootstrapMode::Introspect).await.unwrap();
        let changes = log.scan(|r| r.action == MutationAction::CatalogChange);
        assert_eq!(changes.len(), 1);
        assert_eq!(catalog.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_schema_evolution_is_logged() {
        let (db, log) = fixture().await;
        let catalog = Catalog::bootstrap(db.clone(), log.clone(), BootstrapMode::Introspect)
            .await
            .unwrap();
        db.add_schema_entry(entry("contacts", "created_at", Constraint::None));
        catalog.refresh(BootstrapMode::Introspect).await.unwrap();
        let changes = log.scan(|r| r.action == MutationAction::CatalogChange);
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[1].details["added"],
            json!(["contacts.created_at"]),
        );
        assert_eq!(catalog.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_declarative_missing_table_is_fatal() {
        let (db, log) = fixture().await;
        let schema = DeclarativeSchema::from_json(&json!({
            "tables": {"orders": {"columns": {"id": {"type": "int8", "pk": true}}}}
        }))
        .unwrap();
        let result = Catalog::bootstrap(db, log, BootstrapMode::Declarative(schema)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_declarative_unknown_live_table_is_ignored() {
        let (db, log) = fixture().await;
        db.add_schema_entry(entry("audit_log", "id", Constraint::PrimaryKey));
        let schema = DeclarativeSchema::from_json(&json!({
            "tables": {"contacts": {"columns": {
                "id": {"type": "int8", "pk": true},
                "email": {"type": "text"}
            }}}
        }))
        .unwrap();
        let catalog = Catalog::bootstrap(db, log, BootstrapMode::Declarative(schema))
            .await
            .unwrap();
        assert_eq!(catalog.unknown_tables().len(), 1);
        assert!(catalog.entries().iter().all(|e| &*e.table == "contacts"));
    }

    #[tokio::test]
    async fn test_dangling_foreign_key_is_rejected() {
        let db = Arc::new(FakeDb::new());
        db.add_schema_entry(entry("orders", "id", Constraint::PrimaryKey));
        db.add_schema_entry(entry(
            "orders",
            "customer_id",
            Constraint::ForeignKey {
                target_table: "customers".parse().unwrap(),
                target_column: "id".parse().unwrap(),
            },
        ));
        let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
        let result = Catalog::bootstrap(db, log, BootstrapMode::Introspect).await;
        assert!(result.is_err());
    }
}
