//! Parsed planner output. The adapter runs `EXPLAIN (FORMAT JSON)` and hands
//! the raw JSON here; everything downstream works with these records.
use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub root: PlanNode,
    pub planning_time_ms: Option<f64>,
    /// Present only under EXPLAIN ANALYZE.
    pub execution_time_ms: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanNode {
    pub node_type: String,
    pub total_cost: f64,
    pub plan_rows: f64,
    pub actual_rows: Option<f64>,
    pub relation: Option<String>,
    pub index_name: Option<String>,
    pub children: Vec<PlanNode>,
}

impl Plan {
    /// Parse the output of `EXPLAIN (FORMAT JSON)`: a one-element array
    /// wrapping a `Plan` object.
    pub fn from_explain_json(value: &JsonValue) -> anyhow::Result<Self> {
        let obj = value
            .as_array()
            .and_then(|a| a.first())
            .unwrap_or(value)
            .as_object()
            .context("explain output is not an object")?;
        let root = obj.get("Plan").context("explain output lacks a Plan key")?;
        Ok(Self {
            root: PlanNode::from_json(root)?,
            planning_time_ms: obj.get("Planning Time").and_then(JsonValue::as_f64),
            execution_time_ms: obj.get("Execution Time").and_then(JsonValue::as_f64),
        })
    }

    pub fn total_cost(&self) -> f64 {
        self.root.total_cost
    }

    pub fn estimated_rows(&self) -> f64 {
        self.root.plan_rows
    }

    pub fn actual_rows(&self) -> Option<f64> {
        self.root.actual_rows
    }

    /// Whether any node in the plan scans through the named index.
    pub fn uses_index(&self, index: &str) -> bool {
        self.root.any(&mut |n| n.index_name.as_deref() == Some(index))
    }

    /// Whether the plan sequentially scans the named relation.
    pub fn seq_scans(&self, relation: &str) -> bool {
        self.root.any(&mut |n| {
            n.node_type == "Seq Scan" && n.relation.as_deref() == Some(relation)
        })
    }
}

impl PlanNode {
    fn from_json(value: &JsonValue) -> anyhow::Result<Self> {
        let obj = value.as_object().context("plan node is not an object")?;
        let children = match obj.get("Plans") {
            Some(JsonValue::Array(plans)) => plans
                .iter()
                .map(PlanNode::from_json)
                .collect::<anyhow::Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            node_type: obj
                .get("Node Type")
                .and_then(JsonValue::as_str)
                .context("plan node lacks Node Type")?
                .to_owned(),
            total_cost: obj.get("Total Cost").and_then(JsonValue::as_f64).unwrap_or(0.0),
            plan_rows: obj.get("Plan Rows").and_then(JsonValue::as_f64).unwrap_or(0.0),
            actual_rows: obj.get("Actual Rows").and_then(JsonValue::as_f64),
            relation: obj
                .get("Relation Name")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
            index_name: obj
                .get("Index Name")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
            children,
        })
    }

    fn any(&self, pred: &mut impl FnMut(&PlanNode) -> bool) -> bool {
        pred(self) || self.children.iter().any(|c| c.any(pred))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Plan;

    #[test]
    fn test_parse_nested_explain_output() {
        let raw = json!([{
            "Plan": {
                "Node Type": "Nested Loop",
                "Total Cost": 123.45,
                "Plan Rows": 10.0,
                "Plans": [
                    {
                        "Node Type": "Index Scan",
                        "Index Name": "ix_contacts_tenant_id_email",
                        "Relation Name": "contacts",
                        "Total Cost": 8.3,
                        "Plan Rows": 1.0
                    },
                    {
                        "Node Type": "Seq Scan",
                        "Relation Name": "orders",
                        "Total Cost": 99.0,
                        "Plan Rows": 1000.0
                    }
                ]
            },
            "Planning Time": 0.2,
            "Execution Time": 1.9
        }]);
        let plan = Plan::from_explain_json(&raw).unwrap();
        assert_eq!(plan.total_cost(), 123.45);
        assert!(plan.uses_index("ix_contacts_tenant_id_email"));
        assert!(!plan.uses_index("ix_other"));
        assert!(plan.seq_scans("orders"));
        assert!(!plan.seq_scans("contacts"));
        assert_eq!(plan.execution_time_ms, Some(1.9));
    }

    #[test]
    fn test_malformed_explain_output() {
        assert!(Plan::from_explain_json(&json!({"nope": 1})).is_err());
        assert!(Plan::from_explain_json(&json!([])).is_err());
    }
}
