//! Cost-benefit scoring of candidate drafts.
//!
//! `benefit = freq x (full_scan_cost - indexed_cost)`, with the full-scan
//! side taken from the planner when it is reliable and from the row-count
//! model otherwise. A cardinality check compares the planner's row estimate
//! against sampled ground truth; past the tolerance the candidate keeps its
//! slot but loses confidence and carries a warning in its rationale.
use common::{
    db::{
        DbAdapter,
        SqlValue,
    },
    knobs::{
        CARDINALITY_TOLERANCE,
        ROW_COST,
        STORAGE_PENALTY_PER_MB,
    },
    types::{
        ColumnType,
        IndexCandidate,
        QueryFingerprint,
    },
};
use planner::PlannerClient;
use serde_json::json;

use crate::{
    candidates::CandidateDraft,
    scorers::{
        Scorer,
        WorkloadContext,
    },
};

/// Rewrite a fingerprint's `?` placeholders as `$n` so the statement can be
/// prepared for EXPLAIN. Parameter values are unknown; nulls keep the
/// planner honest about generic plans.
pub fn fingerprint_to_sql(fp: &QueryFingerprint) -> (String, Vec<SqlValue>) {
    let mut sql = String::with_capacity(fp.as_str().len() + 8);
    let mut params = Vec::new();
    for c in fp.as_str().chars() {
        if c == '?' {
            params.push(SqlValue::Null);
            sql.push('$');
            sql.push_str(&params.len().to_string());
        } else {
            sql.push(c);
        }
    }
    (sql, params)
}

fn per_entry_width(column_type: &ColumnType) -> u64 {
    match column_type {
        ColumnType::Boolean => 9,
        ColumnType::Integer | ColumnType::BigInt | ColumnType::Float => 16,
        ColumnType::Timestamp => 16,
        ColumnType::Uuid | ColumnType::Numeric => 24,
        ColumnType::Text | ColumnType::Other(_) => 40,
        ColumnType::Json | ColumnType::Bytes | ColumnType::Geometry | ColumnType::TsVector => 64,
    }
}

pub struct ScoringInputs<'a> {
    pub db: &'a dyn DbAdapter,
    pub planner: &'a PlannerClient,
    pub scorers: &'a [Box<dyn Scorer>],
}

pub async fn score_draft(
    inputs: &ScoringInputs<'_>,
    draft: CandidateDraft,
    column_types: &[ColumnType],
    workload: &WorkloadContext,
) -> anyhow::Result<IndexCandidate> {
    let rows = workload.rows.max(1);
    let mut warnings: Vec<String> = Vec::new();

    let first_column = &draft.columns[0];
    let distinct = inputs
        .db
        .distinct_estimate(&draft.table, first_column)
        .await
        .unwrap_or(1)
        .max(1);
    // Fraction of the table an equality probe on the leading column retains.
    let retained = 1.0 / distinct as f64;

    // Full-scan cost: planner when possible, row-count model otherwise.
    let mut full_scan_cost = rows as f64 * *ROW_COST;
    let mut planner_cost_used = false;
    if let Some(fp) = draft.motivating.first() {
        if !inputs.planner.is_unreliable(fp) {
            let (sql, params) = fingerprint_to_sql(fp);
            match inputs.planner.explain(fp, &sql, &params, false).await {
                Ok(plan) => {
                    full_scan_cost = plan.total_cost();
                    planner_cost_used = true;

                    // Cardinality restriction testing: the planner's row
                    // estimate against sampled ground truth.
                    let sample = inputs
                        .db
                        .sample_values(&draft.table, first_column, 100)
                        .await
                        .unwrap_or_default();
                    if !sample.is_empty() {
                        let mut unique = sample.clone();
                        unique.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
                        unique.dedup();
                        let truth = rows as f64 / unique.len().max(1) as f64;
                        let estimated = plan.estimated_rows().max(1.0);
                        let divergence = (estimated / truth).max(truth / estimated);
                        if divergence > *CARDINALITY_TOLERANCE {
                            warnings.push(format!(
                                "planner row estimate diverges {divergence:.0}x from sampled \
                                 ground truth"
                            ));
                        }
                    }
                },
                Err(_) => {
                    warnings.push("planner unavailable; using row-count heuristics".to_owned());
                },
            }
        } else {
            warnings.push("fingerprint is planner-unreliable; using row-count heuristics".to_owned());
        }
    }

    let indexed_cost =
        rows as f64 * retained * *ROW_COST + (rows.max(2) as f64).log2() * *ROW_COST;
    let mut benefit = draft.freq as f64 * (full_scan_cost - indexed_cost).max(0.0);
    if !warnings.is_empty() {
        // Demoted confidence: half credit when the evidence is shaky.
        benefit *= 0.5;
    }

    let type_multiplier: f64 = column_types.iter().map(ColumnType::build_multiplier).sum::<f64>()
        / column_types.len().max(1) as f64;
    let build_cost = rows as f64 * type_multiplier * draft.method.build_multiplier() * *ROW_COST;

    let entry_width: u64 = 16 + column_types.iter().map(per_entry_width).sum::<u64>();
    let size_estimate_bytes = rows * entry_width;
    let storage_penalty = *STORAGE_PENALTY_PER_MB * size_estimate_bytes as f64 / (1024.0 * 1024.0);

    let mut score = benefit - build_cost - storage_penalty;
    let mut adjustments = Vec::new();
    for scorer in inputs.scorers {
        let verdict = scorer.score(&draft, workload);
        let adjustment = verdict.adjustment();
        if adjustment != 0.0 {
            adjustments.push(json!({"scorer": scorer.name(), "adjustment": adjustment}));
        }
        score += adjustment;
    }

    let rationale = json!({
        "source": draft.source,
        "freq": draft.freq,
        "rows": rows,
        "distinct_leading": distinct,
        "full_scan_cost": full_scan_cost,
        "planner_cost_used": planner_cost_used,
        "indexed_cost": indexed_cost,
        "benefit": benefit,
        "build_cost": build_cost,
        "storage_penalty": storage_penalty,
        "scorer_adjustments": adjustments,
        "corr_strength": draft.corr_strength,
        "warnings": warnings,
        "workload": {
            "reads": workload.activity.reads,
            "writes": workload.activity.writes,
            "read_ratio": workload.activity.read_ratio(),
            "existing_indexes": workload.existing_indexes,
        },
    });

    Ok(IndexCandidate {
        tenant: draft.tenant,
        table: draft.table,
        columns: draft.columns,
        predicate: None,
        expression: None,
        method: draft.method,
        build_cost,
        benefit,
        score,
        size_estimate_bytes,
        rationale,
        motivating_fingerprints: draft.motivating,
        paired_drop: None,
    })
}

#[cfg(test)]
mod tests {
    use common::{
        db::SqlValue,
        types::QueryFingerprint,
    };

    use super::fingerprint_to_sql;

    #[test]
    fn test_fingerprint_to_sql_numbers_placeholders() {
        let fp = QueryFingerprint::from_normalized(
            "select * from contacts where tenant_id = ? and email = ?".to_owned(),
        );
        let (sql, params) = fingerprint_to_sql(&fp);
        assert_eq!(
            sql,
            "select * from contacts where tenant_id = $1 and email = $2"
        );
        assert_eq!(params, vec![SqlValue::Null, SqlValue::Null]);
    }
}
