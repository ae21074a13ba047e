//! Cached view of the database's live indexes. Invalidated atomically at
//! every mutation-commit boundary; everyone reads through it so a completed
//! mutation is immediately visible.
use std::sync::Arc;

use common::{
    db::DbAdapter,
    types::LiveIndex,
};
use parking_lot::Mutex;

pub struct LiveIndexCache {
    db: Arc<dyn DbAdapter>,
    cached: Mutex<Option<Arc<Vec<LiveIndex>>>>,
}

impl LiveIndexCache {
    pub fn new(db: Arc<dyn DbAdapter>) -> Self {
        Self {
            db,
            cached: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> anyhow::Result<Arc<Vec<LiveIndex>>> {
        if let Some(cached) = self.cached.lock().clone() {
            return Ok(cached);
        }
        let fresh = Arc::new(self.db.introspect_indexes(None).await?);
        *self.cached.lock() = Some(fresh.clone());
        Ok(fresh)
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        db::DbAdapter,
        testing::FakeDb,
        types::{
            IndexDefinition,
            IndexMethod,
        },
    };

    use super::LiveIndexCache;

    #[tokio::test]
    async fn test_serves_cached_until_invalidated() {
        let db = Arc::new(FakeDb::new());
        db.add_table(&"contacts".parse().unwrap(), 100);
        let cache = LiveIndexCache::new(db.clone());
        assert_eq!(cache.get().await.unwrap().len(), 0);

        db.create_index(
            &IndexDefinition {
                name: "ix_contacts_email".parse().unwrap(),
                table: "contacts".parse().unwrap(),
                columns: vec!["email".parse().unwrap()],
                predicate: None,
                method: IndexMethod::Ordered,
            },
            true,
        )
        .await
        .unwrap();

        // Stale until someone invalidates at the commit boundary.
        assert_eq!(cache.get().await.unwrap().len(), 0);
        cache.invalidate();
        assert_eq!(cache.get().await.unwrap().len(), 1);
    }
}
