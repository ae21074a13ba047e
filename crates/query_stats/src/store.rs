//! The query stats store: a bounded, non-blocking ingest path feeding
//! per-fingerprint aggregates, plus snapshot reads for the decision engine.
use std::{
    collections::{
        BTreeMap,
        HashMap,
        VecDeque,
    },
    hash::{
        DefaultHasher,
        Hash,
        Hasher,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use common::{
    db::{
        DbAdapter,
        SqlValue,
    },
    identifier::TableName,
    knobs::{
        EWMA_ALPHA,
        INGEST_BATCH_SIZE,
        INGEST_BUFFER_SIZE,
        QUERY_SAMPLE_RING,
        SPIKE_BUCKET,
    },
    types::{
        QueryFingerprint,
        TableActivity,
        TenantId,
    },
};
use parking_lot::{
    Mutex,
    RwLock,
};
use tokio::sync::Notify;

use crate::{
    fingerprint::fingerprint,
    metrics::{
        log_fingerprints_tracked,
        log_ingest_dropped,
        log_ingested,
    },
    sketch::{
        DistinctSketch,
        Ewma,
        LatencySketch,
    },
    spike::{
        BucketHistory,
        Classification,
    },
    sqlrefs::{
        self,
        StatementRefs,
    },
};

#[derive(Clone, Debug)]
pub struct QueryObservation {
    pub tenant: TenantId,
    pub raw_sql: String,
    pub params: Vec<String>,
    pub duration: Duration,
    /// Precomputed fingerprint, if the caller already has one.
    pub fingerprint: Option<QueryFingerprint>,
    pub ts: DateTime<Utc>,
}

struct Aggregate {
    count: u64,
    ewma: Ewma,
    latency: LatencySketch,
    distinct: DistinctSketch,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    refs: StatementRefs,
    buckets: BucketHistory,
}

/// A read-side view of one fingerprint's aggregates.
#[derive(Clone, Debug)]
pub struct FingerprintStats {
    pub tenant: TenantId,
    pub fingerprint: QueryFingerprint,
    pub count: u64,
    pub ewma_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub distinct_params: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub refs: StatementRefs,
    pub classification: Classification,
}

#[derive(Clone, Debug, Default)]
pub struct SnapshotFilter {
    pub tenant: Option<TenantId>,
    pub table: Option<TableName>,
    pub min_count: u64,
}

struct Sample {
    tenant: TenantId,
    fingerprint: QueryFingerprint,
    params_hash: String,
    duration_ms: f64,
    ts: DateTime<Utc>,
}

pub struct QueryStatsStore {
    queue: Mutex<VecDeque<QueryObservation>>,
    notify: Notify,
    dropped: AtomicU64,
    aggregates: RwLock<BTreeMap<(TenantId, QueryFingerprint), Aggregate>>,
    activity: RwLock<HashMap<(TenantId, TableName), TableActivity>>,
    samples: Mutex<VecDeque<Sample>>,
}

const UPSERT_STAT_SQL: &str = "INSERT INTO indexpilot_query_stat \
     (tenant, fingerprint, count, ewma_duration_ms, p95_ms, first_seen, last_seen, columns_read) \
     VALUES ($1, $2, $3, $4, $5, to_timestamp($6), to_timestamp($7), $8) \
     ON CONFLICT (tenant, fingerprint) DO UPDATE SET count = EXCLUDED.count, \
     ewma_duration_ms = EXCLUDED.ewma_duration_ms, p95_ms = EXCLUDED.p95_ms, \
     last_seen = EXCLUDED.last_seen, columns_read = EXCLUDED.columns_read";

const INSERT_SAMPLE_SQL: &str = "INSERT INTO indexpilot_query_sample \
     (tenant, fingerprint, params_hash, duration_ms, ts) \
     VALUES ($1, $2, $3, $4, to_timestamp($5))";

const EVICT_SAMPLES_SQL: &str = "DELETE FROM indexpilot_query_sample WHERE ts < (\
     SELECT ts FROM indexpilot_query_sample ORDER BY ts DESC OFFSET $1 LIMIT 1)";

impl QueryStatsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            aggregates: RwLock::new(BTreeMap::new()),
            activity: RwLock::new(HashMap::new()),
            samples: Mutex::new(VecDeque::new()),
        })
    }

    /// Enqueue an observation. Bounded cost: a full buffer drops the oldest
    /// sample and counts the drop instead of blocking the observer.
    pub fn observe(&self, observation: QueryObservation) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(observation);
            if queue.len() > *INGEST_BUFFER_SIZE {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log_ingest_dropped();
            }
        }
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Spawn the single consumer task that drains the ingest queue.
    pub fn start_consumer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                store.notify.notified().await;
                store.drain_batches();
            }
        })
    }

    /// Drain every queued observation in bounded batches. Exposed so tests
    /// and forced passes can run the consumer inline.
    pub fn drain_batches(&self) {
        loop {
            let batch: Vec<QueryObservation> = {
                let mut queue = self.queue.lock();
                let take = queue.len().min(*INGEST_BATCH_SIZE);
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                return;
            }
            for observation in batch {
                self.apply(observation);
            }
        }
    }

    fn apply(&self, observation: QueryObservation) {
        let fp = observation
            .fingerprint
            .unwrap_or_else(|| fingerprint(&observation.raw_sql));
        let duration_ms = observation.duration.as_secs_f64() * 1e3;
        let bucket = observation.ts.timestamp().max(0) as u64 / SPIKE_BUCKET.as_secs().max(1);

        let mut aggregates = self.aggregates.write();
        let aggregate = aggregates
            .entry((observation.tenant.clone(), fp.clone()))
            .or_insert_with(|| {
                let refs = sqlrefs::parse(&fp);
                Aggregate {
                    count: 0,
                    ewma: Ewma::new(*EWMA_ALPHA),
                    latency: LatencySketch::new(),
                    distinct: DistinctSketch::new(),
                    first_seen: observation.ts,
                    last_seen: observation.ts,
                    refs,
                    buckets: BucketHistory::default(),
                }
            });
        aggregate.count += 1;
        aggregate.ewma.observe(duration_ms);
        aggregate.latency.observe_ms(duration_ms);
        aggregate.distinct.observe(&observation.params);
        aggregate.last_seen = observation.ts;
        aggregate.buckets.observe(bucket);
        let table = aggregate.refs.table.clone();
        let is_write = aggregate.refs.is_write;
        log_fingerprints_tracked(aggregates.len());
        drop(aggregates);

        if let Some(table) = table {
            let mut activity = self.activity.write();
            let entry = activity
                .entry((observation.tenant.clone(), table))
                .or_default();
            if is_write {
                entry.writes += 1;
            } else {
                entry.reads += 1;
            }
        }

        let mut samples = self.samples.lock();
        samples.push_back(Sample {
            tenant: observation.tenant,
            fingerprint: fp,
            params_hash: params_hash(&observation.params),
            duration_ms,
            ts: observation.ts,
        });
        if samples.len() > *QUERY_SAMPLE_RING {
            samples.pop_front();
        }
        log_ingested();
    }

    /// A consistent snapshot of aggregates matching the filter.
    pub fn snapshot(&self, filter: &SnapshotFilter, now: DateTime<Utc>) -> Vec<FingerprintStats> {
        let current_bucket = now.timestamp().max(0) as u64 / SPIKE_BUCKET.as_secs().max(1);
        let aggregates = self.aggregates.read();
        aggregates
            .iter()
            .filter(|((tenant, _), aggregate)| {
                filter.tenant.as_ref().is_none_or(|t| t == tenant)
                    && filter
                        .table
                        .as_ref()
                        .is_none_or(|t| aggregate.refs.table.as_ref() == Some(t))
                    && aggregate.count >= filter.min_count
            })
            .map(|((tenant, fp), aggregate)| FingerprintStats {
                tenant: tenant.clone(),
                fingerprint: fp.clone(),
                count: aggregate.count,
                ewma_ms: aggregate.ewma.value(),
                p95_ms: aggregate.latency.p95_ms(),
                p99_ms: aggregate.latency.p99_ms(),
                distinct_params: aggregate.distinct.estimate(),
                first_seen: aggregate.first_seen,
                last_seen: aggregate.last_seen,
                refs: aggregate.refs.clone(),
                classification: aggregate.buckets.classify(current_bucket),
            })
            .collect()
    }

    /// Read/write activity per table for one tenant, or across all tenants.
    pub fn table_activity(&self, tenant: Option<&TenantId>) -> BTreeMap<TableName, TableActivity> {
        let activity = self.activity.read();
        let mut out: BTreeMap<TableName, TableActivity> = BTreeMap::new();
        for ((t, table), entry) in activity.iter() {
            if tenant.is_none_or(|wanted| wanted == t) {
                let slot = out.entry(table.clone()).or_default();
                slot.reads += entry.reads;
                slot.writes += entry.writes;
            }
        }
        out
    }

    /// Tenants with any recorded aggregates.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .aggregates
            .read()
            .keys()
            .map(|(t, _)| t.clone())
            .collect();
        tenants.dedup();
        tenants
    }

    /// Persist aggregates to the metadata tables and trim the sample ring.
    pub async fn flush(&self, db: &dyn DbAdapter) -> anyhow::Result<()> {
        let stats = self.snapshot(&SnapshotFilter::default(), Utc::now());
        for s in stats {
            let columns: Vec<String> = s
                .refs
                .referenced_columns()
                .iter()
                .map(|c| c.to_string())
                .collect();
            db.exec(
                UPSERT_STAT_SQL,
                &[
                    SqlValue::Text(s.tenant.to_string()),
                    SqlValue::Text(s.fingerprint.as_str().to_owned()),
                    SqlValue::Int(s.count as i64),
                    SqlValue::Float(s.ewma_ms),
                    SqlValue::Float(s.p95_ms),
                    SqlValue::Float(s.first_seen.timestamp_micros() as f64 / 1e6),
                    SqlValue::Float(s.last_seen.timestamp_micros() as f64 / 1e6),
                    SqlValue::Json(serde_json::json!(columns)),
                ],
            )
            .await?;
        }
        let samples: Vec<Sample> = {
            let mut guard = self.samples.lock();
            guard.drain(..).collect()
        };
        for sample in &samples {
            db.exec(
                INSERT_SAMPLE_SQL,
                &[
                    SqlValue::Text(sample.tenant.to_string()),
                    SqlValue::Text(sample.fingerprint.as_str().to_owned()),
                    SqlValue::Text(sample.params_hash.clone()),
                    SqlValue::Float(sample.duration_ms),
                    SqlValue::Float(sample.ts.timestamp_micros() as f64 / 1e6),
                ],
            )
            .await?;
        }
        if !samples.is_empty() {
            db.exec(
                EVICT_SAMPLES_SQL,
                &[SqlValue::Int(*QUERY_SAMPLE_RING as i64)],
            )
            .await?;
        }
        Ok(())
    }
}

fn params_hash(params: &[String]) -> String {
    let mut hasher = DefaultHasher::new();
    params.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{
        TimeZone,
        Utc,
    };
    use common::types::TenantId;

    use super::{
        QueryObservation,
        QueryStatsStore,
        SnapshotFilter,
    };
    use crate::spike::Classification;

    fn observation(sql: &str, day: i64, duration_ms: u64) -> QueryObservation {
        QueryObservation {
            tenant: TenantId::new("acme"),
            raw_sql: sql.to_owned(),
            params: vec![day.to_string()],
            duration: Duration::from_millis(duration_ms),
            fingerprint: None,
            ts: Utc.timestamp_opt(1_700_000_000 + day * 86_400, 0).unwrap(),
        }
    }

    #[test]
    fn test_aggregation_and_snapshot() {
        let store = QueryStatsStore::new();
        for day in 0..7 {
            for _ in 0..10 {
                store.observe(observation(
                    "SELECT * FROM contacts WHERE tenant_id = 1 AND email = 'x'",
                    day,
                    25,
                ));
            }
        }
        store.drain_batches();

        let now = Utc.timestamp_opt(1_700_000_000 + 6 * 86_400, 0).unwrap();
        let snapshot = store.snapshot(&SnapshotFilter::default(), now);
        assert_eq!(snapshot.len(), 1);
        let stats = &snapshot[0];
        assert_eq!(stats.count, 70);
        assert!(stats.ewma_ms > 0.0);
        assert_eq!(stats.classification, Classification::Sustained);
        assert_eq!(&**stats.refs.table.as_ref().unwrap(), "contacts");
    }

    #[test]
    fn test_min_count_filter() {
        let store = QueryStatsStore::new();
        store.observe(observation("SELECT * FROM contacts WHERE id = 1", 0, 5));
        store.drain_batches();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(
            store
                .snapshot(
                    &SnapshotFilter {
                        min_count: 2,
                        ..Default::default()
                    },
                    now
                )
                .len(),
            0
        );
    }

    #[test]
    fn test_table_activity_split_reads_writes() {
        let store = QueryStatsStore::new();
        for _ in 0..7 {
            store.observe(observation("SELECT * FROM contacts WHERE id = 1", 0, 5));
        }
        for _ in 0..3 {
            store.observe(observation("UPDATE contacts SET email = 'x' WHERE id = 1", 0, 5));
        }
        store.drain_batches();
        let activity = store.table_activity(None);
        let contacts = activity.get(&"contacts".parse().unwrap()).unwrap();
        assert_eq!(contacts.reads, 7);
        assert_eq!(contacts.writes, 3);
        assert!((contacts.read_ratio() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_full_buffer_drops_oldest_and_counts() {
        let store = QueryStatsStore::new();
        let capacity = *common::knobs::INGEST_BUFFER_SIZE;
        for i in 0..capacity + 10 {
            store.observe(observation("SELECT 1 FROM t WHERE a = 1", 0, i as u64));
        }
        assert_eq!(store.dropped_count(), 10);
        store.drain_batches();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let snapshot = store.snapshot(&SnapshotFilter::default(), now);
        assert_eq!(snapshot[0].count as usize, capacity);
    }
}
