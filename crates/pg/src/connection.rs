//! A small connection pool over tokio-postgres.
//!
//! Concurrency is bounded by a semaphore sized to `INDEXPILOT_POOL_MAX`;
//! waiting past the acquire timeout fails with PoolExhausted. Each pooled
//! connection keeps a bounded LRU of prepared statements so a chatty control
//! plane does not grow server-side statement memory without bound.
use std::{
    num::NonZeroUsize,
    sync::Arc,
};

use anyhow::Context;
use errors::ErrorMetadata;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{
    OwnedSemaphorePermit,
    Semaphore,
};
use tokio_postgres::{
    types::ToSql,
    Client,
    NoTls,
    Row,
    Statement,
};

use crate::metrics::{
    connections_gauge,
    get_connection_timer,
};

const MAX_CACHED_STATEMENTS: usize = 64;

pub(crate) struct PooledClient {
    client: Client,
    statements: LruCache<String, Statement>,
}

impl PooledClient {
    async fn prepare_cached(&mut self, sql: &str) -> anyhow::Result<Statement> {
        if let Some(statement) = self.statements.get(sql) {
            return Ok(statement.clone());
        }
        let statement = self.client.prepare(sql).await?;
        self.statements.put(sql.to_owned(), statement.clone());
        Ok(statement)
    }

    pub(crate) async fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        let statement = self.prepare_cached(sql).await?;
        Ok(self.client.query(&statement, params).await?)
    }

    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        let statement = self.prepare_cached(sql).await?;
        Ok(self.client.execute(&statement, params).await?)
    }

    /// Simple-protocol execution, for DDL and SET statements that must not be
    /// prepared.
    pub(crate) async fn batch_execute(&mut self, sql: &str) -> anyhow::Result<()> {
        Ok(self.client.batch_execute(sql).await?)
    }
}

pub(crate) struct ConnectionPool {
    url: String,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<PooledClient>>,
}

pub(crate) struct PoolGuard {
    _permit: OwnedSemaphorePermit,
    client: Option<PooledClient>,
    pool: Arc<ConnectionPool>,
}

impl std::ops::Deref for PoolGuard {
    type Target = PooledClient;

    fn deref(&self) -> &PooledClient {
        self.client.as_ref().expect("client taken before drop")
    }
}

impl std::ops::DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut PooledClient {
        self.client.as_mut().expect("client taken before drop")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.client.is_closed() {
                self.pool.idle.lock().push(client);
            }
        }
        connections_gauge(self.pool.idle.lock().len() as f64);
    }
}

impl ConnectionPool {
    pub(crate) fn new(url: String, max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            url,
            semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
            idle: Mutex::new(Vec::new()),
        })
    }

    pub(crate) async fn acquire(self: &Arc<Self>) -> anyhow::Result<PoolGuard> {
        let timer = get_connection_timer();
        let permit = tokio::time::timeout(
            *common::knobs::ACQUIRE_TIMEOUT,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| anyhow::anyhow!(ErrorMetadata::pool_exhausted()))?
        .context("pool semaphore closed")?;

        let client = match self.idle.lock().pop() {
            Some(client) if !client.client.is_closed() => Some(client),
            _ => None,
        };
        let client = match client {
            Some(client) => client,
            None => self.connect().await?,
        };
        timer.finish();
        Ok(PoolGuard {
            _permit: permit,
            client: Some(client),
            pool: self.clone(),
        })
    }

    async fn connect(&self) -> anyhow::Result<PooledClient> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(|e| {
                anyhow::anyhow!(e).context(ErrorMetadata::connection_lost(
                    "failed to open a database connection",
                ))
            })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("postgres connection terminated: {e}");
            }
        });
        Ok(PooledClient {
            client,
            statements: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_STATEMENTS).expect("nonzero cache bound"),
            ),
        })
    }
}
