//! Per-tenant expression profile: which catalog entries are active for a
//! tenant's analysis. Everything is active by default; deactivations are
//! explicit and persisted, so they survive restarts.
use std::{
    collections::BTreeSet,
    sync::Arc,
};

use common::{
    db::{
        DbAdapter,
        SqlValue,
    },
    types::{
        CatalogEntry,
        CatalogKey,
        TenantId,
    },
};
use parking_lot::RwLock;

const LOAD_SQL: &str = "SELECT tenant, table_name, column_name \
     FROM indexpilot_expression_profile WHERE NOT active";

const DEACTIVATE_SQL: &str = "INSERT INTO indexpilot_expression_profile \
     (tenant, table_name, column_name, active) VALUES ($1, $2, $3, false) \
     ON CONFLICT (tenant, table_name, column_name) DO UPDATE SET active = false";

const ACTIVATE_SQL: &str = "DELETE FROM indexpilot_expression_profile \
     WHERE tenant = $1 AND table_name = $2 AND column_name = $3";

pub struct ExpressionProfile {
    db: Arc<dyn DbAdapter>,
    deactivated: RwLock<BTreeSet<(TenantId, CatalogKey)>>,
}

impl ExpressionProfile {
    pub async fn load(db: Arc<dyn DbAdapter>) -> anyhow::Result<Self> {
        let rowset = db.exec(LOAD_SQL, &[]).await?.rows();
        let mut deactivated = BTreeSet::new();
        for i in 0..rowset.len() {
            let Some(tenant) = rowset.get(i, "tenant").and_then(SqlValue::as_str) else {
                continue;
            };
            let Some(table) = rowset
                .get(i, "table_name")
                .and_then(SqlValue::as_str)
                .and_then(|s| s.parse().ok())
            else {
                continue;
            };
            let Some(column) = rowset
                .get(i, "column_name")
                .and_then(SqlValue::as_str)
                .and_then(|s| s.parse().ok())
            else {
                continue;
            };
            deactivated.insert((TenantId::new(tenant), CatalogKey { table, column }));
        }
        Ok(Self {
            db,
            deactivated: RwLock::new(deactivated),
        })
    }

    pub fn is_active(&self, tenant: &TenantId, key: &CatalogKey) -> bool {
        !self
            .deactivated
            .read()
            .contains(&(tenant.clone(), key.clone()))
    }

    pub async fn deactivate(&self, tenant: &TenantId, key: &CatalogKey) -> anyhow::Result<()> {
        self.db
            .exec(
                DEACTIVATE_SQL,
                &[
                    SqlValue::Text(tenant.to_string()),
                    SqlValue::Text(key.table.to_string()),
                    SqlValue::Text(key.column.to_string()),
                ],
            )
            .await?;
        self.deactivated
            .write()
            .insert((tenant.clone(), key.clone()));
        Ok(())
    }

    pub async fn activate(&self, tenant: &TenantId, key: &CatalogKey) -> anyhow::Result<()> {
        self.db
            .exec(
                ACTIVATE_SQL,
                &[
                    SqlValue::Text(tenant.to_string()),
                    SqlValue::Text(key.table.to_string()),
                    SqlValue::Text(key.column.to_string()),
                ],
            )
            .await?;
        self.deactivated
            .write()
            .remove(&(tenant.clone(), key.clone()));
        Ok(())
    }

    pub async fn bulk_set(
        &self,
        tenant: &TenantId,
        keys: &[CatalogKey],
        active: bool,
    ) -> anyhow::Result<()> {
        for key in keys {
            if active {
                self.activate(tenant, key).await?;
            } else {
                self.deactivate(tenant, key).await?;
            }
        }
        Ok(())
    }

    /// Restrict a set of catalog entries to those active for the tenant.
    pub fn filter_active(&self, tenant: &TenantId, entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        let deactivated = self.deactivated.read();
        entries
            .into_iter()
            .filter(|e| !deactivated.contains(&(tenant.clone(), e.key())))
            .collect()
    }

    /// The effective deactivation set, for the read API.
    pub fn deactivations(&self) -> Vec<(TenantId, CatalogKey)> {
        self.deactivated.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        testing::FakeDb,
        types::{
            CatalogKey,
            TenantId,
        },
    };

    use super::ExpressionProfile;

    fn key(table: &str, column: &str) -> CatalogKey {
        CatalogKey {
            table: table.parse().unwrap(),
            column: column.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_default_active_and_explicit_deactivation() {
        let db = Arc::new(FakeDb::new());
        let profile = ExpressionProfile::load(db.clone()).await.unwrap();
        let tenant = TenantId::new("acme");
        let k = key("contacts", "email");

        assert!(profile.is_active(&tenant, &k));
        profile.deactivate(&tenant, &k).await.unwrap();
        assert!(!profile.is_active(&tenant, &k));
        // Deactivation is per tenant.
        assert!(profile.is_active(&TenantId::new("globex"), &k));

        profile.activate(&tenant, &k).await.unwrap();
        assert!(profile.is_active(&tenant, &k));

        // The deactivation round-tripped through the metadata table.
        assert!(db
            .exec_log()
            .iter()
            .any(|s| s.contains("indexpilot_expression_profile")));
    }
}
