//! Planner client: `EXPLAIN` with a bounded result cache and per-fingerprint
//! failure accounting.
//!
//! Results are cached by (statement, parameter hash) with a TTL. After three
//! consecutive planner failures for one fingerprint, the fingerprint is
//! marked planner-unreliable for a cooldown period; during the cooldown the
//! client refuses immediately and callers fall back to row-count heuristics.
mod metrics;

use std::{
    collections::HashMap,
    hash::{
        DefaultHasher,
        Hash,
        Hasher,
    },
    num::NonZeroUsize,
    sync::Arc,
    time::Instant,
};

use common::{
    db::{
        DbAdapter,
        SqlValue,
    },
    knobs::{
        EXPLAIN_CACHE_SIZE,
        EXPLAIN_CACHE_TTL,
        PLANNER_COOLDOWN,
        PLANNER_FAILURE_THRESHOLD,
    },
    plan::Plan,
    types::QueryFingerprint,
};
use errors::ErrorMetadata;
use lru::LruCache;
use parking_lot::Mutex;

use crate::metrics::{
    log_cache_hit,
    log_cache_miss,
    log_planner_failure,
    log_unreliable_marked,
};

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    sql: String,
    params_hash: u64,
    analyze: bool,
}

struct CachedPlan {
    plan: Plan,
    fetched_at: Instant,
}

#[derive(Default)]
struct FailureState {
    consecutive: u32,
    unreliable_until: Option<Instant>,
}

struct Inner {
    cache: LruCache<CacheKey, CachedPlan>,
    failures: HashMap<QueryFingerprint, FailureState>,
}

pub struct PlannerClient {
    db: Arc<dyn DbAdapter>,
    inner: Mutex<Inner>,
}

fn params_hash(params: &[SqlValue]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for p in params {
        match p {
            SqlValue::Null => 0u8.hash(&mut hasher),
            SqlValue::Bool(v) => (1u8, v).hash(&mut hasher),
            SqlValue::Int(v) => (2u8, v).hash(&mut hasher),
            SqlValue::Float(v) => (3u8, v.to_bits()).hash(&mut hasher),
            SqlValue::Text(v) => (4u8, v).hash(&mut hasher),
            SqlValue::Bytes(v) => (5u8, v).hash(&mut hasher),
            SqlValue::Json(v) => (6u8, v.to_string()).hash(&mut hasher),
        }
    }
    hasher.finish()
}

impl PlannerClient {
    pub fn new(db: Arc<dyn DbAdapter>) -> Self {
        Self {
            db,
            inner: Mutex::new(Inner {
                cache: LruCache::new(
                    NonZeroUsize::new((*EXPLAIN_CACHE_SIZE).max(1)).expect("nonzero cache size"),
                ),
                failures: HashMap::new(),
            }),
        }
    }

    /// Whether the fingerprint is inside an unreliability cooldown.
    pub fn is_unreliable(&self, fingerprint: &QueryFingerprint) -> bool {
        let inner = self.inner.lock();
        inner
            .failures
            .get(fingerprint)
            .and_then(|s| s.unreliable_until)
            .is_some_and(|until| Instant::now() < until)
    }

    pub async fn explain(
        &self,
        fingerprint: &QueryFingerprint,
        sql: &str,
        params: &[SqlValue],
        analyze: bool,
    ) -> anyhow::Result<Plan> {
        self.explain_inner(fingerprint, sql, params, analyze, true).await
    }

    /// Bypass the cache read (the result is still stored). Used after DDL,
    /// when a cached plan would predate the new index.
    pub async fn explain_fresh(
        &self,
        fingerprint: &QueryFingerprint,
        sql: &str,
        params: &[SqlValue],
        analyze: bool,
    ) -> anyhow::Result<Plan> {
        self.explain_inner(fingerprint, sql, params, analyze, false).await
    }

    async fn explain_inner(
        &self,
        fingerprint: &QueryFingerprint,
        sql: &str,
        params: &[SqlValue],
        analyze: bool,
        read_cache: bool,
    ) -> anyhow::Result<Plan> {
        if self.is_unreliable(fingerprint) {
            anyhow::bail!(ErrorMetadata::planner_unavailable(
                "fingerprint is in planner-unreliable cooldown",
            ));
        }
        let key = CacheKey {
            sql: sql.to_owned(),
            params_hash: params_hash(params),
            analyze,
        };
        if read_cache {
            let mut inner = self.inner.lock();
            if let Some(cached) = inner.cache.get(&key) {
                if cached.fetched_at.elapsed() < *EXPLAIN_CACHE_TTL {
                    log_cache_hit();
                    return Ok(cached.plan.clone());
                }
                inner.cache.pop(&key);
            }
        }
        log_cache_miss();
        match self.db.explain(sql, params, analyze).await {
            Ok(plan) => {
                let mut inner = self.inner.lock();
                inner.failures.remove(fingerprint);
                inner.cache.put(
                    key,
                    CachedPlan {
                        plan: plan.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(plan)
            },
            Err(e) => {
                log_planner_failure();
                let mut inner = self.inner.lock();
                let state = inner.failures.entry(fingerprint.clone()).or_default();
                state.consecutive += 1;
                if state.consecutive >= *PLANNER_FAILURE_THRESHOLD {
                    state.unreliable_until = Some(Instant::now() + *PLANNER_COOLDOWN);
                    state.consecutive = 0;
                    log_unreliable_marked();
                }
                Err(e)
            },
        }
    }
}
