//! Tunable limits and parameters for the daemon.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. The six variables listed in the operator documentation
//! (`INDEXPILOT_DATABASE_URL`, `INDEXPILOT_BYPASS_MODE`,
//! `INDEXPILOT_AUTO_INDEXER_MODE`, `INDEXPILOT_MAINTENANCE_WINDOW`,
//! `INDEXPILOT_STATEMENT_TIMEOUT_MS`, `INDEXPILOT_POOL_MAX`) are part of the
//! stable surface; the rest are tuning levers with safe defaults.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

// ---------------------------------------------------------------------------
// Connection pool and statement timeouts.
// ---------------------------------------------------------------------------

/// Upper bound on pooled database connections.
pub static POOL_MAX: LazyLock<usize> = LazyLock::new(|| env_config("INDEXPILOT_POOL_MAX", 8));

/// How long to wait for a pooled connection before failing with
/// PoolExhausted.
pub static ACQUIRE_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("INDEXPILOT_ACQUIRE_TIMEOUT_MS", 5_000)));

/// Statement timeout for ordinary queries and EXPLAIN ANALYZE runs.
pub static STATEMENT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("INDEXPILOT_STATEMENT_TIMEOUT_MS", 30_000)));

/// Separate, much longer timeout for concurrent index builds.
pub static LONG_DDL_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("INDEXPILOT_LONG_DDL_TIMEOUT_MS", 3_600_000))
});

/// lock_timeout applied to DDL statements.
pub static LOCK_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("INDEXPILOT_LOCK_TIMEOUT_MS", 10_000)));

// ---------------------------------------------------------------------------
// Planner client.
// ---------------------------------------------------------------------------

/// Entry bound of the EXPLAIN result cache.
pub static EXPLAIN_CACHE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_EXPLAIN_CACHE_SIZE", 512));

/// TTL of a cached EXPLAIN result.
pub static EXPLAIN_CACHE_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXPILOT_EXPLAIN_CACHE_TTL_SECS", 300)));

/// Consecutive planner failures before a fingerprint is marked
/// planner-unreliable.
pub static PLANNER_FAILURE_THRESHOLD: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEXPILOT_PLANNER_FAILURE_THRESHOLD", 3));

/// Cooldown during which an unreliable fingerprint skips the planner and
/// callers fall back to row-count heuristics.
pub static PLANNER_COOLDOWN: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXPILOT_PLANNER_COOLDOWN_SECS", 600)));

// ---------------------------------------------------------------------------
// Query stats ingest and aggregation.
// ---------------------------------------------------------------------------

/// Capacity of the bounded ingest channel. A full channel drops the oldest
/// sample rather than blocking the observer.
pub static INGEST_BUFFER_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_INGEST_BUFFER_SIZE", 8_192));

/// Samples drained per consumer batch.
pub static INGEST_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_INGEST_BATCH_SIZE", 256));

/// EWMA smoothing factor for per-fingerprint latency.
pub static EWMA_ALPHA: LazyLock<f64> = LazyLock::new(|| env_config("INDEXPILOT_EWMA_ALPHA", 0.1));

/// Bound on retained rows in the query_sample ring.
pub static QUERY_SAMPLE_RING: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_QUERY_SAMPLE_RING", 10_000));

// ---------------------------------------------------------------------------
// Spike detection.
// ---------------------------------------------------------------------------

/// A fingerprint must appear in at least this many of the last
/// `SPIKE_BUCKET_WINDOW` buckets to count as sustained.
pub static SPIKE_BUCKETS_REQUIRED: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_SPIKE_BUCKETS_REQUIRED", 5));

/// Number of history buckets considered by the spike detector.
pub static SPIKE_BUCKET_WINDOW: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_SPIKE_BUCKET_WINDOW", 7));

/// Width of one spike-detector bucket.
pub static SPIKE_BUCKET: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXPILOT_SPIKE_BUCKET_SECS", 86_400)));

/// Current-bucket count above `multiplier x median(history)` classifies the
/// fingerprint as a spike.
pub static SPIKE_MULTIPLIER: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_SPIKE_MULTIPLIER", 3.0));

// ---------------------------------------------------------------------------
// Decision engine.
// ---------------------------------------------------------------------------

/// Minimum observation count before a fingerprint can motivate a candidate.
pub static MIN_FINGERPRINT_COUNT: LazyLock<u64> =
    LazyLock::new(|| env_config("INDEXPILOT_MIN_FINGERPRINT_COUNT", 50));

/// Fraction of observations in which two columns must co-occur to form a
/// composite candidate.
pub static CORR_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_CORR_THRESHOLD", 0.6));

/// Planner row estimates diverging from sampled ground truth by more than
/// this factor demote candidate confidence.
pub static CARDINALITY_TOLERANCE: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_CARDINALITY_TOLERANCE", 10.0));

/// Abstract cost of scanning one row without an index.
pub static ROW_COST: LazyLock<f64> = LazyLock::new(|| env_config("INDEXPILOT_ROW_COST", 0.01));

/// Bound on the additive adjustment any pluggable scorer may contribute.
pub static SCORER_WEIGHT: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_SCORER_WEIGHT", 100.0));

/// Baseline score a candidate must clear before workload shaping. Abstract
/// cost units, same scale as `ROW_COST`.
pub static SCORE_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_SCORE_THRESHOLD", 1.0));

/// Read ratio at or above which a table counts as read-heavy.
pub static READ_HEAVY_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_READ_HEAVY_THRESHOLD", 0.7));

/// Read ratio at or below which a table counts as write-heavy.
pub static WRITE_HEAVY_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_WRITE_HEAVY_THRESHOLD", 0.3));

/// Per existing index, per write-unit penalty subtracted from a candidate's
/// score on the same table.
pub static WRITE_PENALTY: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_WRITE_PENALTY", 0.05));

/// Storage penalty per estimated megabyte of index size.
pub static STORAGE_PENALTY_PER_MB: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_STORAGE_PENALTY_PER_MB", 0.5));

/// Ceiling on secondary indexes per table.
pub static MAX_INDEXES_PER_TABLE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_MAX_INDEXES_PER_TABLE", 8));

/// Ceiling on candidates emitted per tenant per pass.
pub static MAX_CANDIDATES_PER_TENANT: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_MAX_CANDIDATES_PER_TENANT", 16));

// ---------------------------------------------------------------------------
// Safeguards.
// ---------------------------------------------------------------------------

/// Global storage ceiling for indexes created by the daemon, in bytes.
pub static GLOBAL_STORAGE_BUDGET_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("INDEXPILOT_GLOBAL_STORAGE_BUDGET_BYTES", 10 * 1024 * 1024 * 1024));

/// Per-tenant storage ceiling, in bytes.
pub static TENANT_STORAGE_BUDGET_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("INDEXPILOT_TENANT_STORAGE_BUDGET_BYTES", 1024 * 1024 * 1024));

/// Consecutive CREATE failures (same table or same error kind) that open the
/// circuit breaker.
pub static BREAKER_FAILURE_THRESHOLD: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEXPILOT_BREAKER_FAILURE_THRESHOLD", 5));

/// Cooldown before an open breaker admits a half-open probe.
pub static BREAKER_COOLDOWN: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXPILOT_BREAKER_COOLDOWN_SECS", 300)));

/// Which streak trips the breaker: "table", "error", or "either".
pub static BREAKER_SCOPE: LazyLock<String> =
    LazyLock::new(|| env_config("INDEXPILOT_BREAKER_SCOPE", "either".to_owned()));

/// Recent write latency above this defers new builds (milliseconds).
pub static WRITE_LATENCY_CEILING_MS: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_WRITE_LATENCY_CEILING_MS", 50.0));

/// Recent write latency above this cancels in-flight non-critical builds.
pub static EMERGENCY_CEILING_MS: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_EMERGENCY_CEILING_MS", 200.0));

/// Token-bucket refill rate for index creation, per hour.
pub static RATE_INDEX_CREATES_PER_HOUR: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEXPILOT_RATE_INDEX_CREATES_PER_HOUR", 6));

/// Token-bucket refill rate for REINDEX, per hour.
pub static RATE_REINDEX_PER_HOUR: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEXPILOT_RATE_REINDEX_PER_HOUR", 2));

/// Token-bucket refill rate for ANALYZE, per hour.
pub static RATE_ANALYZE_PER_HOUR: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEXPILOT_RATE_ANALYZE_PER_HOUR", 12));

/// Maintenance window specification, e.g. "always", "never", or
/// "mon-fri 02:00-05:00;sat,sun 00:00-06:00".
pub static MAINTENANCE_WINDOW: LazyLock<String> =
    LazyLock::new(|| env_config("INDEXPILOT_MAINTENANCE_WINDOW", "always".to_owned()));

/// Enables canary validation of new indexes on a traffic fraction.
pub static CANARY_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_CANARY_ENABLED", false));

/// Fraction of observed traffic sampled while a canary index is shadowed.
pub static CANARY_FRACTION: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_CANARY_FRACTION", 0.1));

/// Bounded sample size that decides canary promotion or rollback.
pub static CANARY_SAMPLE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXPILOT_CANARY_SAMPLE", 200));

// ---------------------------------------------------------------------------
// Executor.
// ---------------------------------------------------------------------------

/// Relative cost improvement VALIDATING requires when the planner does not
/// adopt the new index outright.
pub static IMPROVEMENT_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_IMPROVEMENT_THRESHOLD", 0.10));

/// Bounded attempts for a retryable index build.
pub static BUILD_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEXPILOT_BUILD_MAX_ATTEMPTS", 4));

/// Initial backoff between build retries.
pub static BUILD_INITIAL_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("INDEXPILOT_BUILD_INITIAL_BACKOFF_MS", 1_000))
});

/// Backoff ceiling between build retries.
pub static BUILD_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("INDEXPILOT_BUILD_MAX_BACKOFF_MS", 60_000)));

// ---------------------------------------------------------------------------
// Scheduler and maintenance loop.
// ---------------------------------------------------------------------------

/// Interval between decision engine passes.
pub static DECISION_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXPILOT_DECISION_INTERVAL_SECS", 600)));

/// Interval between maintenance loop passes.
pub static MAINTENANCE_INTERVAL: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("INDEXPILOT_MAINTENANCE_INTERVAL_SECS", 3_600))
});

/// Scan count below which an index is considered unused.
pub static MIN_SCANS: LazyLock<u64> = LazyLock::new(|| env_config("INDEXPILOT_MIN_SCANS", 50));

/// Days without use before an unused index is proposed for DROP.
pub static DAYS_UNUSED: LazyLock<u64> = LazyLock::new(|| env_config("INDEXPILOT_DAYS_UNUSED", 30));

/// Bloat fraction above which a concurrent REINDEX is scheduled.
pub static BLOAT_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("INDEXPILOT_BLOAT_THRESHOLD", 0.3));

/// Last-analyze age beyond which a table gets ANALYZE.
pub static STATS_STALENESS: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("INDEXPILOT_STATS_STALENESS_SECS", 7 * 86_400))
});

/// A BUILDING state older than this is reaped as hanging.
pub static HANG_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXPILOT_HANG_TIMEOUT_SECS", 2 * 3_600)));

/// Advisory locks older than this are released by the integrity sweep.
pub static STALE_LOCK_THRESHOLD: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("INDEXPILOT_STALE_LOCK_THRESHOLD_SECS", 6 * 3_600))
});

/// Allows the maintenance loop to actually drop unused indexes instead of
/// only proposing the drop.
pub static AUTO_CLEANUP_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_AUTO_CLEANUP_ENABLED", false));

/// Per-subtask switches for the maintenance loop.
pub static INTEGRITY_SWEEP_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_INTEGRITY_SWEEP_ENABLED", true));

/// See [`INTEGRITY_SWEEP_ENABLED`].
pub static UNUSED_DETECTION_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_UNUSED_DETECTION_ENABLED", true));

/// See [`INTEGRITY_SWEEP_ENABLED`].
pub static REDUNDANCY_DETECTION_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_REDUNDANCY_DETECTION_ENABLED", true));

/// See [`INTEGRITY_SWEEP_ENABLED`].
pub static BLOAT_REBUILD_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_BLOAT_REBUILD_ENABLED", true));

/// See [`INTEGRITY_SWEEP_ENABLED`].
pub static STATS_REFRESH_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_STATS_REFRESH_ENABLED", true));

/// See [`INTEGRITY_SWEEP_ENABLED`].
pub static HANGING_REAP_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_HANGING_REAP_ENABLED", true));

/// See [`INTEGRITY_SWEEP_ENABLED`].
pub static HEALTH_REPORT_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_HEALTH_REPORT_ENABLED", true));

/// Allows automatic rollback of committed indexes that regress.
pub static AUTO_ROLLBACK: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEXPILOT_AUTO_ROLLBACK", true));

/// "advisory" records proposals without applying DDL; "apply" executes them.
pub static AUTO_INDEXER_MODE: LazyLock<String> =
    LazyLock::new(|| env_config("INDEXPILOT_AUTO_INDEXER_MODE", "advisory".to_owned()));
