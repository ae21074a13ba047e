//! Candidate collection: turn sustained fingerprints, foreign keys, and
//! covering opportunities into index drafts for scoring.
use std::collections::BTreeMap;

use common::{
    identifier::{
        ColumnName,
        TableName,
    },
    knobs::{
        CORR_THRESHOLD,
        MIN_FINGERPRINT_COUNT,
    },
    types::{
        CatalogEntry,
        CatalogKey,
        ColumnType,
        IndexMethod,
        LiveIndex,
        QueryFingerprint,
        TenantId,
    },
};
use query_stats::{
    Classification,
    ColumnUsage,
    FingerprintStats,
};
use serde::Serialize;

/// Tables below this size never get a BRIN draft; block-range indexes only
/// pay off on very large, append-mostly relations.
const BRIN_MIN_ROWS: u64 = 10_000_000;

/// How many columns a covering proposal may span.
const COVERING_MAX_COLUMNS: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    EqualityFilter,
    RangeFilter,
    Ordering,
    Join,
    Composite,
    ForeignKey,
    Covering,
}

/// An unscored index proposal.
#[derive(Clone, Debug)]
pub struct CandidateDraft {
    pub tenant: TenantId,
    pub table: TableName,
    pub columns: Vec<ColumnName>,
    pub method: IndexMethod,
    pub source: CandidateSource,
    pub motivating: Vec<QueryFingerprint>,
    /// Total observations across the motivating fingerprints.
    pub freq: u64,
    /// Co-occurrence strength for composite drafts.
    pub corr_strength: Option<f64>,
}

pub struct CollectionContext<'a> {
    pub tenant: &'a TenantId,
    /// Catalog entries active for this tenant, keyed by (table, column).
    pub active: &'a BTreeMap<CatalogKey, ColumnType>,
    pub rows: &'a BTreeMap<TableName, u64>,
    pub distinct: &'a BTreeMap<CatalogKey, u64>,
    pub foreign_keys: &'a [CatalogEntry],
    pub live_indexes: &'a [LiveIndex],
}

impl CollectionContext<'_> {
    fn column_type(&self, table: &TableName, column: &ColumnName) -> Option<&ColumnType> {
        self.active.get(&CatalogKey {
            table: table.clone(),
            column: column.clone(),
        })
    }

    fn selectivity(&self, table: &TableName, column: &ColumnName) -> f64 {
        let rows = self.rows.get(table).copied().unwrap_or(0).max(1);
        let distinct = self
            .distinct
            .get(&CatalogKey {
                table: table.clone(),
                column: column.clone(),
            })
            .copied()
            .unwrap_or(1);
        distinct as f64 / rows as f64
    }
}

fn method_for(column_type: &ColumnType, usage: ColumnUsage, rows: u64) -> IndexMethod {
    match column_type.preferred_method() {
        IndexMethod::Ordered
            if usage == ColumnUsage::Range
                && *column_type == ColumnType::Timestamp
                && rows >= BRIN_MIN_ROWS =>
        {
            IndexMethod::Brin
        },
        method => method,
    }
}

struct DraftSet {
    drafts: BTreeMap<(TableName, Vec<ColumnName>, IndexMethod), CandidateDraft>,
}

impl DraftSet {
    fn new() -> Self {
        Self {
            drafts: BTreeMap::new(),
        }
    }

    fn merge(&mut self, draft: CandidateDraft) {
        let key = (draft.table.clone(), draft.columns.clone(), draft.method);
        match self.drafts.get_mut(&key) {
            Some(existing) => {
                existing.freq += draft.freq;
                for fp in draft.motivating {
                    if !existing.motivating.contains(&fp) {
                        existing.motivating.push(fp);
                    }
                }
                if draft.corr_strength.is_some() {
                    existing.corr_strength = draft.corr_strength;
                }
            },
            None => {
                self.drafts.insert(key, draft);
            },
        }
    }

    fn into_vec(self) -> Vec<CandidateDraft> {
        self.drafts.into_values().collect()
    }
}

/// Collect drafts from the sustained portion of a stats snapshot. Spiky
/// fingerprints are returned separately so the caller can record their
/// suppression.
pub fn collect(
    stats: &[FingerprintStats],
    ctx: &CollectionContext<'_>,
) -> (Vec<CandidateDraft>, Vec<FingerprintStats>) {
    let mut drafts = DraftSet::new();
    let mut suppressed = Vec::new();

    let eligible: Vec<&FingerprintStats> = stats
        .iter()
        .filter(|s| {
            if s.count < *MIN_FINGERPRINT_COUNT {
                return false;
            }
            match s.classification {
                Classification::Sustained => true,
                Classification::Spike => {
                    suppressed.push((*s).clone());
                    false
                },
            }
        })
        .collect();

    for stat in &eligible {
        let Some(table) = stat.refs.table.clone() else {
            continue;
        };
        let rows = ctx.rows.get(&table).copied().unwrap_or(0);

        // Single-column drafts from every usage kind.
        for (usage, source) in [
            (ColumnUsage::Equality, CandidateSource::EqualityFilter),
            (ColumnUsage::Range, CandidateSource::RangeFilter),
            (ColumnUsage::Ordering, CandidateSource::Ordering),
            (ColumnUsage::Join, CandidateSource::Join),
        ] {
            for column in stat.refs.columns_with_usage(usage) {
                let Some(column_type) = ctx.column_type(&table, &column) else {
                    // Unknown or deactivated for this tenant.
                    continue;
                };
                drafts.merge(CandidateDraft {
                    tenant: ctx.tenant.clone(),
                    table: table.clone(),
                    columns: vec![column.clone()],
                    method: method_for(column_type, usage, rows),
                    source,
                    motivating: vec![stat.fingerprint.clone()],
                    freq: stat.count,
                    corr_strength: None,
                });
            }
        }

        // Composite draft: correlated equality filters within one statement.
        let eq_columns: Vec<ColumnName> = stat
            .refs
            .columns_with_usage(ColumnUsage::Equality)
            .into_iter()
            .filter(|c| ctx.column_type(&table, c).is_some())
            .collect();
        if eq_columns.len() >= 2 {
            let table_total: u64 = eligible
                .iter()
                .filter(|s| s.refs.table.as_ref() == Some(&table))
                .map(|s| s.count)
                .sum();
            let strength = stat.count as f64 / table_total.max(1) as f64;
            if strength >= *CORR_THRESHOLD {
                let mut ordered = eq_columns.clone();
                // Most frequently equality-filtered first; ties go to the
                // column with the smaller scan fraction (distinct/rows), so a
                // coarse partitioning column like tenant_id leads and the
                // prefix stays reusable.
                ordered.sort_by(|a, b| {
                    let freq = |c: &ColumnName| -> u64 {
                        eligible
                            .iter()
                            .filter(|s| {
                                s.refs.table.as_ref() == Some(&table)
                                    && s.refs
                                        .columns_with_usage(ColumnUsage::Equality)
                                        .contains(c)
                            })
                            .map(|s| s.count)
                            .sum()
                    };
                    freq(b).cmp(&freq(a)).then_with(|| {
                        ctx.selectivity(&table, a)
                            .partial_cmp(&ctx.selectivity(&table, b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.cmp(b))
                    })
                });
                drafts.merge(CandidateDraft {
                    tenant: ctx.tenant.clone(),
                    table: table.clone(),
                    columns: ordered,
                    method: IndexMethod::Ordered,
                    source: CandidateSource::Composite,
                    motivating: vec![stat.fingerprint.clone()],
                    freq: stat.count,
                    corr_strength: Some(strength),
                });
            }
        }

        // Covering draft: the whole statement fits in a small column set.
        if !stat.refs.projection.is_empty() {
            let mut columns = eq_columns.clone();
            for column in &stat.refs.projection {
                if ctx.column_type(&table, column).is_some() && !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
            if !eq_columns.is_empty()
                && columns.len() > eq_columns.len()
                && columns.len() <= COVERING_MAX_COLUMNS
            {
                drafts.merge(CandidateDraft {
                    tenant: ctx.tenant.clone(),
                    table: table.clone(),
                    columns,
                    method: IndexMethod::Ordered,
                    source: CandidateSource::Covering,
                    motivating: vec![stat.fingerprint.clone()],
                    freq: stat.count,
                    corr_strength: None,
                });
            }
        }
    }

    // Foreign-key columns without a covering index.
    for fk in ctx.foreign_keys {
        let covered = ctx
            .live_indexes
            .iter()
            .any(|ix| ix.table == fk.table && ix.columns.first() == Some(&fk.column));
        if covered {
            continue;
        }
        let join_freq: u64 = eligible
            .iter()
            .filter(|s| {
                s.refs.table.as_ref() == Some(&fk.table)
                    && s.refs
                        .columns_with_usage(ColumnUsage::Join)
                        .contains(&fk.column)
            })
            .map(|s| s.count)
            .sum();
        drafts.merge(CandidateDraft {
            tenant: ctx.tenant.clone(),
            table: fk.table.clone(),
            columns: vec![fk.column.clone()],
            method: IndexMethod::Ordered,
            source: CandidateSource::ForeignKey,
            motivating: Vec::new(),
            freq: join_freq.max(1),
            corr_strength: None,
        });
    }

    (drafts.into_vec(), suppressed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use common::types::{
        CatalogKey,
        ColumnType,
        TenantId,
    };
    use query_stats::{
        fingerprint,
        sqlrefs,
        Classification,
        FingerprintStats,
    };

    use super::{
        collect,
        CandidateSource,
        CollectionContext,
    };

    fn stats_for(sql: &str, count: u64, classification: Classification) -> FingerprintStats {
        let fp = fingerprint(sql);
        let refs = sqlrefs::parse(&fp);
        FingerprintStats {
            tenant: TenantId::new("acme"),
            fingerprint: fp,
            count,
            ewma_ms: 12.0,
            p95_ms: 30.0,
            p99_ms: 45.0,
            distinct_params: count / 2,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            refs,
            classification,
        }
    }

    fn key(table: &str, column: &str) -> CatalogKey {
        CatalogKey {
            table: table.parse().unwrap(),
            column: column.parse().unwrap(),
        }
    }

    #[test]
    fn test_sustained_equality_produces_composite_draft() {
        let tenant = TenantId::new("acme");
        let active = BTreeMap::from([
            (key("contacts", "tenant_id"), ColumnType::Text),
            (key("contacts", "email"), ColumnType::Text),
        ]);
        let rows = BTreeMap::from([("contacts".parse().unwrap(), 100_000u64)]);
        let distinct = BTreeMap::from([
            (key("contacts", "tenant_id"), 100u64),
            (key("contacts", "email"), 90_000u64),
        ]);
        let ctx = CollectionContext {
            tenant: &tenant,
            active: &active,
            rows: &rows,
            distinct: &distinct,
            foreign_keys: &[],
            live_indexes: &[],
        };
        let stats = vec![stats_for(
            "SELECT * FROM contacts WHERE tenant_id = 1 AND email = 'x'",
            1000,
            Classification::Sustained,
        )];
        let (drafts, suppressed) = collect(&stats, &ctx);
        assert!(suppressed.is_empty());

        let composite = drafts
            .iter()
            .find(|d| d.source == CandidateSource::Composite)
            .expect("composite draft");
        // The two columns tie on equality frequency; the smaller scan
        // fraction puts tenant_id in front.
        assert_eq!(composite.columns.len(), 2);
        assert_eq!(&*composite.columns[0], "tenant_id");
        assert_eq!(&*composite.columns[1], "email");
        assert!(composite.corr_strength.unwrap() >= 0.6);

        // Single-column drafts for both equality columns as well.
        let singles: Vec<_> = drafts
            .iter()
            .filter(|d| d.source == CandidateSource::EqualityFilter)
            .collect();
        assert_eq!(singles.len(), 2);
    }

    #[test]
    fn test_spikes_are_suppressed_not_drafted() {
        let tenant = TenantId::new("acme");
        let active = BTreeMap::from([(key("contacts", "email"), ColumnType::Text)]);
        let rows = BTreeMap::from([("contacts".parse().unwrap(), 100_000u64)]);
        let distinct = BTreeMap::new();
        let ctx = CollectionContext {
            tenant: &tenant,
            active: &active,
            rows: &rows,
            distinct: &distinct,
            foreign_keys: &[],
            live_indexes: &[],
        };
        let stats = vec![stats_for(
            "SELECT * FROM contacts WHERE email = 'x'",
            5000,
            Classification::Spike,
        )];
        let (drafts, suppressed) = collect(&stats, &ctx);
        assert!(drafts.is_empty());
        assert_eq!(suppressed.len(), 1);
    }

    #[test]
    fn test_deactivated_column_is_invisible() {
        let tenant = TenantId::new("acme");
        // email is not in the active set for this tenant.
        let active = BTreeMap::from([(key("contacts", "tenant_id"), ColumnType::Text)]);
        let rows = BTreeMap::from([("contacts".parse().unwrap(), 100_000u64)]);
        let distinct = BTreeMap::new();
        let ctx = CollectionContext {
            tenant: &tenant,
            active: &active,
            rows: &rows,
            distinct: &distinct,
            foreign_keys: &[],
            live_indexes: &[],
        };
        let stats = vec![stats_for(
            "SELECT * FROM contacts WHERE email = 'x'",
            1000,
            Classification::Sustained,
        )];
        let (drafts, _) = collect(&stats, &ctx);
        assert!(drafts.is_empty());
    }

    #[test]
    fn test_low_count_fingerprints_are_ignored() {
        let tenant = TenantId::new("acme");
        let active = BTreeMap::from([(key("contacts", "email"), ColumnType::Text)]);
        let rows = BTreeMap::new();
        let distinct = BTreeMap::new();
        let ctx = CollectionContext {
            tenant: &tenant,
            active: &active,
            rows: &rows,
            distinct: &distinct,
            foreign_keys: &[],
            live_indexes: &[],
        };
        let stats = vec![stats_for(
            "SELECT * FROM contacts WHERE email = 'x'",
            3,
            Classification::Sustained,
        )];
        let (drafts, suppressed) = collect(&stats, &ctx);
        assert!(drafts.is_empty());
        assert!(suppressed.is_empty());
    }
}
