//! Constraint optimization over the scored candidate set: a deterministic
//! greedy knapsack by score density under the storage budgets and count
//! ceilings, with prefix-equivalent candidates collapsed to the longer one.
use std::collections::BTreeMap;

use common::{
    identifier::TableName,
    types::{
        IndexCandidate,
        LiveIndex,
        MutationId,
    },
};

pub struct Constraints {
    pub tenant_budget_bytes: u64,
    pub global_budget_bytes: u64,
    pub tenant_used_bytes: u64,
    pub global_used_bytes: u64,
    pub max_indexes_per_table: usize,
    pub max_candidates: usize,
}

pub struct Selection {
    pub selected: Vec<IndexCandidate>,
    pub rejected: Vec<(IndexCandidate, &'static str)>,
}

fn prefix_equivalent(a: &IndexCandidate, b: &IndexCandidate) -> bool {
    if a.method != b.method || a.predicate != b.predicate || a.table != b.table {
        return false;
    }
    let (short, long) = if a.columns.len() <= b.columns.len() {
        (a, b)
    } else {
        (b, a)
    };
    long.columns[..short.columns.len()] == short.columns[..]
}

/// MutationId of the most similar existing index (longest shared column
/// prefix), used as the deterministic tie-breaker the emission order calls
/// for.
fn similar_mid(candidate: &IndexCandidate, live: &[LiveIndex]) -> MutationId {
    live.iter()
        .filter(|ix| ix.table == candidate.table)
        .map(|ix| {
            let shared = ix
                .columns
                .iter()
                .zip(candidate.columns.iter())
                .take_while(|(a, b)| a == b)
                .count();
            (shared, ix.created_by.unwrap_or_default())
        })
        .max_by_key(|(shared, _)| *shared)
        .map(|(_, mid)| mid)
        .unwrap_or_default()
}

pub fn select(
    mut candidates: Vec<IndexCandidate>,
    existing_per_table: &BTreeMap<TableName, usize>,
    live: &[LiveIndex],
    constraints: &Constraints,
) -> Selection {
    let mut rejected = Vec::new();

    // Prefix-equivalence: of two candidates where one's column list is a
    // prefix of the other's, only the longer may be selected.
    let mut keep: Vec<IndexCandidate> = Vec::new();
    for candidate in candidates.drain(..) {
        let mut action = None;
        for (i, kept) in keep.iter().enumerate() {
            if prefix_equivalent(&candidate, kept) {
                if candidate.columns.len() > kept.columns.len() {
                    action = Some(Ok(i));
                } else {
                    action = Some(Err(()));
                }
                break;
            }
        }
        match action {
            Some(Ok(i)) => {
                let shorter = std::mem::replace(&mut keep[i], candidate);
                rejected.push((shorter, "prefix-equivalent"));
            }
            Some(Err(())) => {
                rejected.push((candidate, "prefix-equivalent"));
            }
            None => {
                keep.push(candidate);
            }
        }
    }

    // Deterministic density order.
    keep.sort_by(|a, b| {
        let density = |c: &IndexCandidate| c.score / c.size_estimate_bytes.max(1) as f64;
        density(b)
            .partial_cmp(&density(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| similar_mid(a, live).cmp(&similar_mid(b, live)))
            .then_with(|| (a.table.clone(), a.columns.clone()).cmp(&(b.table.clone(), b.columns.clone())))
    });

    let mut selected: Vec<IndexCandidate> = Vec::new();
    let mut tenant_spent = constraints.tenant_used_bytes;
    let mut global_spent = constraints.global_used_bytes;
    let mut per_table: BTreeMap<TableName, usize> = existing_per_table.clone();

    for candidate in keep {
        if selected.len() >= constraints.max_candidates {
            rejected.push((candidate, "candidate-ceiling"));
            continue;
        }
        let table_count = per_table.get(&candidate.table).copied().unwrap_or(0);
        if table_count >= constraints.max_indexes_per_table {
            rejected.push((candidate, "table-ceiling"));
            continue;
        }
        if tenant_spent + candidate.size_estimate_bytes > constraints.tenant_budget_bytes
            || global_spent + candidate.size_estimate_bytes > constraints.global_budget_bytes
        {
            rejected.push((candidate, "budget-exceeded"));
            continue;
        }
        tenant_spent += candidate.size_estimate_bytes;
        global_spent += candidate.size_estimate_bytes;
        *per_table.entry(candidate.table.clone()).or_default() += 1;
        selected.push(candidate);
    }

    Selection { selected, rejected }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use common::types::{
        IndexCandidate,
        IndexMethod,
        TenantId,
    };

    use super::{
        select,
        Constraints,
    };

    const MB: u64 = 1024 * 1024;

    fn candidate(table: &str, columns: &[&str], score: f64, size: u64) -> IndexCandidate {
        IndexCandidate {
            tenant: TenantId::new("acme"),
            table: table.parse().unwrap(),
            columns: columns.iter().map(|c| c.parse().unwrap()).collect(),
            predicate: None,
            expression: None,
            method: IndexMethod::Ordered,
            build_cost: 1.0,
            benefit: score,
            score,
            size_estimate_bytes: size,
            rationale: serde_json::json!({}),
            motivating_fingerprints: Vec::new(),
            paired_drop: None,
        }
    }

    fn constraints(tenant_budget: u64) -> Constraints {
        Constraints {
            tenant_budget_bytes: tenant_budget,
            global_budget_bytes: u64::MAX,
            tenant_used_bytes: 0,
            global_used_bytes: 0,
            max_indexes_per_table: 8,
            max_candidates: 16,
        }
    }

    #[test]
    fn test_budget_exhaustion_selects_three_of_five() {
        let candidates: Vec<_> = (0..5)
            .map(|i| candidate("t", &[format!("c{i}").leak()], 100.0, 30 * MB))
            .collect();
        let selection = select(
            candidates,
            &BTreeMap::new(),
            &[],
            &constraints(100 * MB),
        );
        assert_eq!(selection.selected.len(), 3);
        assert_eq!(selection.rejected.len(), 2);
        assert!(selection
            .rejected
            .iter()
            .all(|(_, reason)| *reason == "budget-exceeded"));
    }

    #[test]
    fn test_prefix_equivalent_keeps_longer() {
        let selection = select(
            vec![
                candidate("t", &["a"], 50.0, MB),
                candidate("t", &["a", "b"], 40.0, MB),
                candidate("t", &["c"], 10.0, MB),
            ],
            &BTreeMap::new(),
            &[],
            &constraints(1000 * MB),
        );
        let selected_cols: Vec<usize> = selection.selected.iter().map(|c| c.columns.len()).collect();
        assert!(selected_cols.contains(&2));
        assert!(!selection
            .selected
            .iter()
            .any(|c| c.columns.len() == 1 && &*c.columns[0] == "a"));
        assert_eq!(selection.rejected.len(), 1);
        assert_eq!(selection.rejected[0].1, "prefix-equivalent");
    }

    #[test]
    fn test_table_ceiling() {
        let existing = BTreeMap::from([("t".parse().unwrap(), 7usize)]);
        let selection = select(
            vec![
                candidate("t", &["a"], 100.0, MB),
                candidate("t", &["b"], 90.0, MB),
            ],
            &existing,
            &[],
            &constraints(1000 * MB),
        );
        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.rejected[0].1, "table-ceiling");
    }

    #[test]
    fn test_density_order_is_deterministic() {
        let a = candidate("t", &["a"], 100.0, 10 * MB);
        let b = candidate("t", &["b"], 100.0, MB);
        let selection = select(
            vec![a, b],
            &BTreeMap::new(),
            &[],
            &constraints(1000 * MB),
        );
        // b has 10x the density and must come first.
        assert_eq!(&*selection.selected[0].columns[0], "b");
    }
}
