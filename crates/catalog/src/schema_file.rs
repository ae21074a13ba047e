//! Declarative schema files. An operator can pin the catalog to a config
//! tree instead of trusting live introspection; the daemon then treats the
//! file as the source of truth and cross-checks the live database.
use std::collections::BTreeMap;

use common::{
    identifier::{
        ColumnName,
        TableName,
    },
    types::{
        CatalogEntry,
        ColumnType,
        Constraint,
    },
};
use errors::ErrorMetadata;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DeclarativeSchema {
    pub tables: BTreeMap<String, DeclarativeTable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclarativeTable {
    pub columns: BTreeMap<String, DeclarativeColumn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclarativeColumn {
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub pk: bool,
    #[serde(default)]
    pub unique: bool,
    /// "table.column" reference.
    #[serde(default)]
    pub fk: Option<String>,
}

impl DeclarativeSchema {
    pub fn from_json(raw: &serde_json::Value) -> anyhow::Result<Self> {
        serde_json::from_value(raw.clone()).map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::malformed_schema(
                "declarative schema file did not parse",
            ))
        })
    }

    /// Expand into catalog entries, validating every identifier and foreign
    /// key reference.
    pub fn entries(&self) -> anyhow::Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();
        for (table_raw, table) in &self.tables {
            let table_name: TableName = table_raw.parse()?;
            for (column_raw, column) in &table.columns {
                let column_name: ColumnName = column_raw.parse()?;
                let constraint = if column.pk {
                    Constraint::PrimaryKey
                } else if column.unique {
                    Constraint::Unique
                } else if let Some(fk) = &column.fk {
                    let (t, c) = fk.split_once('.').ok_or_else(|| {
                        anyhow::anyhow!(ErrorMetadata::malformed_schema(format!(
                            "foreign key on {table_name} must be table.column"
                        )))
                    })?;
                    Constraint::ForeignKey {
                        target_table: t.parse()?,
                        target_column: c.parse()?,
                    }
                } else {
                    Constraint::None
                };
                entries.push(CatalogEntry {
                    table: table_name.clone(),
                    column: column_name,
                    column_type: ColumnType::from_pg_typname(&column.column_type),
                    nullable: column.nullable,
                    constraint,
                });
            }
        }
        Ok(entries)
    }
}
