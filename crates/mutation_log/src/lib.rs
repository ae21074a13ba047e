//! The append-only mutation log.
//!
//! All writers funnel through one ordered channel into a single writer task,
//! which allocates strictly monotonic MutationIds, persists the record to the
//! metadata table, and only then acknowledges the append. A crash mid-DDL
//! therefore always leaves the intent record behind. Readers observe a
//! consistent prefix of the in-memory tail; nothing is ever deleted, and a
//! rollback is a new record referencing the record it reverses.
mod metrics;

use std::sync::Arc;

use chrono::{
    DateTime,
    Utc,
};
use common::{
    db::{
        DbAdapter,
        SqlValue,
    },
    identifier::{
        IndexName,
        TableName,
    },
    types::{
        MutationAction,
        MutationId,
        MutationRecord,
        TenantId,
    },
};
use errors::ErrorMetadata;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::metrics::{
    log_append,
    log_latest_mid,
};

const APPEND_CHANNEL_SIZE: usize = 256;

const INSERT_SQL: &str = "INSERT INTO indexpilot_mutation_log \
     (mid, ts, tenant, action, target_table, target_index, details, prev_mid) \
     VALUES ($1, to_timestamp($2), $3, $4, $5, $6, $7, $8)";

const LOAD_SQL: &str = "SELECT mid, extract(epoch FROM ts)::float8 AS ts_epoch, tenant, action, \
     target_table, target_index, details, prev_mid \
     FROM indexpilot_mutation_log ORDER BY mid";

/// A record as submitted by a writer; the log assigns the id and timestamp.
#[derive(Clone, Debug)]
pub struct NewMutation {
    pub tenant: Option<TenantId>,
    pub action: MutationAction,
    pub table: Option<TableName>,
    pub index: Option<IndexName>,
    pub details: JsonValue,
    pub prev_mid: Option<MutationId>,
}

struct AppendRequest {
    mutation: NewMutation,
    reply: oneshot::Sender<anyhow::Result<MutationId>>,
}

#[derive(Clone)]
pub struct MutationLog {
    tx: mpsc::Sender<AppendRequest>,
    tail: Arc<RwLock<Vec<MutationRecord>>>,
}

pub struct MutationLogWriter {
    handle: tokio::task::JoinHandle<()>,
}

impl MutationLogWriter {
    /// Wait for the writer to drain its queue. Senders must be dropped first
    /// (the daemon drops its `MutationLog` clones during shutdown).
    pub async fn drain(self) {
        let _ = self.handle.await;
    }
}

impl MutationLog {
    /// Load the persisted log and start the writer task. The id sequence
    /// continues from the highest persisted mid.
    pub async fn open(db: Arc<dyn DbAdapter>) -> anyhow::Result<(Self, MutationLogWriter)> {
        let existing = load_existing(&*db).await?;
        verify_contiguous(&existing)?;
        let last_id = existing.last().map(|r| r.id).unwrap_or_default();
        log_latest_mid(last_id);
        let tail = Arc::new(RwLock::new(existing));

        let (tx, mut rx) = mpsc::channel::<AppendRequest>(APPEND_CHANNEL_SIZE);
        let writer_tail = tail.clone();
        let handle = tokio::spawn(async move {
            let mut next = last_id.next();
            while let Some(request) = rx.recv().await {
                let record = MutationRecord {
                    id: next,
                    ts: Utc::now(),
                    tenant: request.mutation.tenant,
                    action: request.mutation.action,
                    table: request.mutation.table,
                    index: request.mutation.index,
                    details: request.mutation.details,
                    prev_mid: request.mutation.prev_mid,
                };
                match persist(&*db, &record).await {
                    Ok(()) => {
                        writer_tail.write().push(record.clone());
                        log_append(record.action);
                        log_latest_mid(record.id);
                        next = next.next();
                        let _ = request.reply.send(Ok(record.id));
                    },
                    Err(e) => {
                        // The id was not consumed; the sequence stays gapless.
                        let _ = request.reply.send(Err(e));
                    },
                }
            }
        });
        Ok((Self { tx, tail }, MutationLogWriter { handle }))
    }

    /// Append a record. Returns once the record is persisted; callers issue
    /// the corresponding DB effect only after this resolves.
    pub async fn append(&self, mutation: NewMutation) -> anyhow::Result<MutationId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AppendRequest { mutation, reply })
            .await
            .map_err(|_| anyhow::anyhow!("mutation log writer has shut down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("mutation log writer dropped the append"))?
    }

    pub fn latest_id(&self) -> MutationId {
        self.tail.read().last().map(|r| r.id).unwrap_or_default()
    }

    pub fn get(&self, mid: MutationId) -> Option<MutationRecord> {
        let tail = self.tail.read();
        // Ids are dense, so the record for mid N sits at offset N-1.
        let first = tail.first()?.id.0;
        tail.get((mid.0.checked_sub(first)?) as usize).cloned()
    }

    /// Records with id strictly greater than `since`, in order.
    pub fn tail_since(&self, since: MutationId) -> Vec<MutationRecord> {
        self.tail
            .read()
            .iter()
            .filter(|r| r.id > since)
            .cloned()
            .collect()
    }

    pub fn scan(&self, mut pred: impl FnMut(&MutationRecord) -> bool) -> Vec<MutationRecord> {
        self.tail.read().iter().filter(|r| pred(r)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tail.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tail.read().is_empty()
    }
}

async fn persist(db: &dyn DbAdapter, record: &MutationRecord) -> anyhow::Result<()> {
    let params = vec![
        SqlValue::Int(record.id.0 as i64),
        SqlValue::Float(record.ts.timestamp_micros() as f64 / 1e6),
        record
            .tenant
            .as_ref()
            .map(|t| SqlValue::Text(t.to_string()))
            .unwrap_or(SqlValue::Null),
        SqlValue::Text(record.action.to_string()),
        record
            .table
            .as_ref()
            .map(|t| SqlValue::Text(t.to_string()))
            .unwrap_or(SqlValue::Null),
        record
            .index
            .as_ref()
            .map(|i| SqlValue::Text(i.to_string()))
            .unwrap_or(SqlValue::Null),
        SqlValue::Json(record.details.clone()),
        record
            .prev_mid
            .map(|m| SqlValue::Int(m.0 as i64))
            .unwrap_or(SqlValue::Null),
    ];
    db.exec(INSERT_SQL, &params).await?;
    Ok(())
}

async fn load_existing(db: &dyn DbAdapter) -> anyhow::Result<Vec<MutationRecord>> {
    let rowset = db.exec(LOAD_SQL, &[]).await?.rows();
    let mut records = Vec::with_capacity(rowset.len());
    for i in 0..rowset.len() {
        let action_str = rowset
            .get(i, "action")
            .and_then(SqlValue::as_str)
            .unwrap_or_default()
            .to_owned();
        let action: MutationAction =
            serde_json::from_value(JsonValue::String(action_str)).map_err(|_| {
                anyhow::anyhow!(ErrorMetadata::corrupted_metadata(
                    "mutation log contains an unknown action",
                ))
            })?;
        records.push(MutationRecord {
            id: MutationId(rowset.get(i, "mid").and_then(SqlValue::as_i64).unwrap_or(0) as u64),
            ts: rowset
                .get(i, "ts_epoch")
                .and_then(SqlValue::as_f64)
                .and_then(|epoch| DateTime::from_timestamp(epoch as i64, 0))
                .unwrap_or_else(Utc::now),
            tenant: rowset
                .get(i, "tenant")
                .and_then(SqlValue::as_str)
                .map(TenantId::new),
            action,
            table: rowset
                .get(i, "target_table")
                .and_then(SqlValue::as_str)
                .and_then(|s| s.parse().ok()),
            index: rowset
                .get(i, "target_index")
                .and_then(SqlValue::as_str)
                .and_then(|s| s.parse().ok()),
            details: match rowset.get(i, "details") {
                Some(SqlValue::Json(v)) => v.clone(),
                _ => JsonValue::Null,
            },
            prev_mid: rowset
                .get(i, "prev_mid")
                .and_then(SqlValue::as_i64)
                .map(|v| MutationId(v as u64)),
        });
    }
    Ok(records)
}

/// A gap in the persisted sequence is an invariant violation; the daemon
/// reacts by alerting and dropping to read-only.
fn verify_contiguous(records: &[MutationRecord]) -> anyhow::Result<()> {
    for pair in records.windows(2) {
        if pair[1].id.0 != pair[0].id.0 + 1 {
            anyhow::bail!(ErrorMetadata::mutation_log_gap(format!(
                "mutation log jumps from {} to {}",
                pair[0].id, pair[1].id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        db::{
            RowSet,
            SqlValue,
        },
        testing::FakeDb,
        types::{
            MutationAction,
            MutationId,
            TenantId,
        },
    };
    use futures::future::try_join_all;

    use super::{
        MutationLog,
        NewMutation,
    };

    fn mutation(action: MutationAction) -> NewMutation {
        NewMutation {
            tenant: Some(TenantId::new("acme")),
            action,
            table: Some("contacts".parse().unwrap()),
            index: Some("ix_contacts_email".parse().unwrap()),
            details: serde_json::json!({"reason": "test"}),
            prev_mid: None,
        }
    }

    #[tokio::test]
    async fn test_ids_are_dense_and_ordered_under_concurrency() {
        let db = Arc::new(FakeDb::new());
        let (log, _writer) = MutationLog::open(db).await.unwrap();

        let appends = (0..20).map(|_| log.append(mutation(MutationAction::Propose)));
        let mut ids = try_join_all(appends).await.unwrap();
        ids.sort();
        let expected: Vec<_> = (1..=20).map(MutationId).collect();
        assert_eq!(ids, expected);

        let tail = log.tail_since(MutationId(0));
        assert_eq!(tail.len(), 20);
        assert!(tail.windows(2).all(|w| w[1].id.0 == w[0].id.0 + 1));
    }

    #[tokio::test]
    async fn test_record_persisted_before_ack() {
        let db = Arc::new(FakeDb::new());
        let (log, _writer) = MutationLog::open(db.clone()).await.unwrap();
        log.append(mutation(MutationAction::Create)).await.unwrap();
        let inserts: Vec<_> = db
            .exec_log()
            .into_iter()
            .filter(|s| s.starts_with("INSERT INTO indexpilot_mutation_log"))
            .collect();
        assert_eq!(inserts.len(), 1);
    }

    #[tokio::test]
    async fn test_tail_since_and_get() {
        let db = Arc::new(FakeDb::new());
        let (log, _writer) = MutationLog::open(db).await.unwrap();
        for _ in 0..5 {
            log.append(mutation(MutationAction::Propose)).await.unwrap();
        }
        assert_eq!(log.tail_since(MutationId(3)).len(), 2);
        assert_eq!(log.get(MutationId(4)).unwrap().id, MutationId(4));
        assert!(log.get(MutationId(9)).is_none());
        assert_eq!(log.latest_id(), MutationId(5));
    }

    #[tokio::test]
    async fn test_open_resumes_sequence_from_persisted_tail() {
        let db = Arc::new(FakeDb::new());
        db.push_rows(RowSet {
            columns: vec![
                "mid".into(),
                "ts_epoch".into(),
                "tenant".into(),
                "action".into(),
                "target_table".into(),
                "target_index".into(),
                "details".into(),
                "prev_mid".into(),
            ],
            rows: vec![
                vec![
                    SqlValue::Int(1),
                    SqlValue::Float(1_700_000_000.0),
                    SqlValue::Null,
                    SqlValue::Text("CREATE".into()),
                    SqlValue::Text("contacts".into()),
                    SqlValue::Text("ix_contacts_email".into()),
                    SqlValue::Json(serde_json::json!({})),
                    SqlValue::Null,
                ],
                vec![
                    SqlValue::Int(2),
                    SqlValue::Float(1_700_000_100.0),
                    SqlValue::Null,
                    SqlValue::Text("COMMIT".into()),
                    SqlValue::Text("contacts".into()),
                    SqlValue::Text("ix_contacts_email".into()),
                    SqlValue::Json(serde_json::json!({})),
                    SqlValue::Int(1),
                ],
            ],
        });
        let (log, _writer) = MutationLog::open(db).await.unwrap();
        assert_eq!(log.latest_id(), MutationId(2));
        let next = log.append(mutation(MutationAction::Propose)).await.unwrap();
        assert_eq!(next, MutationId(3));
    }

    #[tokio::test]
    async fn test_gap_in_persisted_log_is_rejected() {
        let db = Arc::new(FakeDb::new());
        db.push_rows(RowSet {
            columns: vec![
                "mid".into(),
                "ts_epoch".into(),
                "tenant".into(),
                "action".into(),
                "target_table".into(),
                "target_index".into(),
                "details".into(),
                "prev_mid".into(),
            ],
            rows: vec![
                vec![
                    SqlValue::Int(1),
                    SqlValue::Float(0.0),
                    SqlValue::Null,
                    SqlValue::Text("CREATE".into()),
                    SqlValue::Null,
                    SqlValue::Null,
                    SqlValue::Json(serde_json::json!({})),
                    SqlValue::Null,
                ],
                vec![
                    SqlValue::Int(3),
                    SqlValue::Float(0.0),
                    SqlValue::Null,
                    SqlValue::Text("DROP".into()),
                    SqlValue::Null,
                    SqlValue::Null,
                    SqlValue::Json(serde_json::json!({})),
                    SqlValue::Null,
                ],
            ],
        });
        let err = MutationLog::open(db).await.err().unwrap();
        use errors::ErrorMetadataAnyhowExt;
        assert_eq!(err.short_msg(), "MutationLogGap");
    }
}
