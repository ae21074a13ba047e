//! A lightweight column-reference parse over normalized statements. It only
//! has to understand SELECT/UPDATE/DELETE with WHERE, JOIN, and ORDER BY
//! clauses well enough to tell the decision engine which columns a query
//! filters, orders, or joins on. Anything it cannot read it ignores.
use common::{
    identifier::{
        ColumnName,
        TableName,
    },
    types::QueryFingerprint,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnUsage {
    Equality,
    Range,
    Ordering,
    Join,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ColumnRef {
    pub column: ColumnName,
    pub usage: ColumnUsage,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatementRefs {
    pub table: Option<TableName>,
    pub is_write: bool,
    pub refs: Vec<ColumnRef>,
    /// Simple projected columns; empty for `*` or expressions.
    pub projection: Vec<ColumnName>,
}

impl StatementRefs {
    pub fn columns_with_usage(&self, usage: ColumnUsage) -> Vec<ColumnName> {
        self.refs
            .iter()
            .filter(|r| r.usage == usage)
            .map(|r| r.column.clone())
            .collect()
    }

    /// All referenced filter/order/join columns in first-seen order.
    pub fn referenced_columns(&self) -> Vec<ColumnName> {
        let mut out: Vec<ColumnName> = Vec::new();
        for r in &self.refs {
            if !out.contains(&r.column) {
                out.push(r.column.clone());
            }
        }
        out
    }
}

fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            current.push(c);
        } else {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            if !c.is_whitespace() {
                tokens.push(c.to_string());
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Strip a table or alias qualifier, keeping the column when the qualifier
/// matches the main table or its alias (or is absent).
fn unqualify<'a>(token: &'a str, table: Option<&str>, alias: Option<&str>) -> Option<&'a str> {
    match token.split_once('.') {
        None => Some(token),
        Some((qualifier, column)) => {
            if Some(qualifier) == table || Some(qualifier) == alias {
                Some(column)
            } else {
                None
            }
        },
    }
}

fn is_clause_boundary(token: &str) -> bool {
    matches!(
        token,
        "where" | "group" | "order" | "limit" | "offset" | "having" | "returning" | "join"
            | "inner" | "left" | "right" | "full" | "on" | "set" | "values" | ";"
    )
}

pub fn parse(fingerprint: &QueryFingerprint) -> StatementRefs {
    let tokens = tokenize(fingerprint.as_str());
    let mut out = StatementRefs::default();
    if tokens.is_empty() {
        return out;
    }

    let statement_kind = tokens[0].as_str();
    out.is_write = matches!(statement_kind, "update" | "delete" | "insert");

    // Main table and alias.
    let mut alias: Option<String> = None;
    let table_pos = match statement_kind {
        "select" | "delete" | "with" => tokens.iter().position(|t| t == "from").map(|i| i + 1),
        "update" => Some(1),
        "insert" => tokens.iter().position(|t| t == "into").map(|i| i + 1),
        _ => None,
    };
    if let Some(pos) = table_pos {
        if let Some(name) = tokens.get(pos) {
            out.table = name.parse().ok();
            match tokens.get(pos + 1) {
                Some(next) if next == "as" => {
                    alias = tokens.get(pos + 2).cloned();
                },
                Some(next) if !is_clause_boundary(next) && next.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                    alias = Some(next.clone());
                },
                _ => {},
            }
        }
    }
    let table_str = out.table.as_ref().map(|t| t.to_string());

    // Projection: only for a SELECT of plain columns.
    if statement_kind == "select" {
        let mut i = 1;
        let mut simple = true;
        let mut projection = Vec::new();
        while i < tokens.len() && tokens[i] != "from" {
            match tokens[i].as_str() {
                "," => {},
                "distinct" => {},
                t => match unqualify(t, table_str.as_deref(), alias.as_deref())
                    .and_then(|c| c.parse::<ColumnName>().ok())
                {
                    Some(column) => projection.push(column),
                    None => simple = false,
                },
            }
            i += 1;
        }
        if simple {
            out.projection = projection;
        }
    }

    let mut push_ref = |out: &mut StatementRefs, column: &str, usage: ColumnUsage| {
        let Some(unqualified) = unqualify(column, table_str.as_deref(), alias.as_deref()) else {
            return;
        };
        let Ok(column) = unqualified.parse::<ColumnName>() else {
            return;
        };
        let reference = ColumnRef { column, usage };
        if !out.refs.contains(&reference) {
            out.refs.push(reference);
        }
    };

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].as_str() {
            // JOIN ... ON a.x = b.y
            "on" => {
                let mut j = i + 1;
                while j < tokens.len() && !is_clause_boundary(&tokens[j]) {
                    if tokens[j] == "=" {
                        if j >= 1 {
                            push_ref(&mut out, &tokens[j - 1], ColumnUsage::Join);
                        }
                        if j + 1 < tokens.len() {
                            push_ref(&mut out, &tokens[j + 1], ColumnUsage::Join);
                        }
                    }
                    j += 1;
                }
                i = j;
            },
            "where" => {
                let mut j = i + 1;
                while j < tokens.len() && !is_clause_boundary(&tokens[j]) {
                    match tokens[j].as_str() {
                        "=" => {
                            if j >= 1 {
                                push_ref(&mut out, &tokens[j - 1], ColumnUsage::Equality);
                            }
                        },
                        ">" | "<" => {
                            if j >= 1 {
                                push_ref(&mut out, &tokens[j - 1], ColumnUsage::Range);
                            }
                        },
                        "between" | "like" | "ilike" => {
                            if j >= 1 {
                                push_ref(&mut out, &tokens[j - 1], ColumnUsage::Range);
                            }
                        },
                        "in" => {
                            if j >= 1 {
                                push_ref(&mut out, &tokens[j - 1], ColumnUsage::Equality);
                            }
                        },
                        _ => {},
                    }
                    j += 1;
                }
                i = j;
            },
            "order" if tokens.get(i + 1).map(String::as_str) == Some("by") => {
                let mut j = i + 2;
                while j < tokens.len() && !is_clause_boundary(&tokens[j]) {
                    match tokens[j].as_str() {
                        "," | "asc" | "desc" => {},
                        t => push_ref(&mut out, t, ColumnUsage::Ordering),
                    }
                    j += 1;
                }
                i = j;
            },
            _ => i += 1,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use common::types::QueryFingerprint;

    use super::{
        parse,
        ColumnUsage,
    };
    use crate::fingerprint::fingerprint;

    fn refs_of(sql: &str) -> super::StatementRefs {
        parse(&fingerprint(sql))
    }

    #[test]
    fn test_equality_and_range_filters() {
        let refs = refs_of(
            "SELECT * FROM contacts WHERE tenant_id = 1 AND email = 'x' AND created_at > 2",
        );
        assert_eq!(&**refs.table.as_ref().unwrap(), "contacts");
        assert!(!refs.is_write);
        let eq = refs.columns_with_usage(ColumnUsage::Equality);
        assert_eq!(eq.len(), 2);
        assert_eq!(&*eq[0], "tenant_id");
        assert_eq!(&*eq[1], "email");
        let range = refs.columns_with_usage(ColumnUsage::Range);
        assert_eq!(range.len(), 1);
        assert_eq!(&*range[0], "created_at");
    }

    #[test]
    fn test_order_by_and_projection() {
        let refs = refs_of("SELECT id, email FROM contacts WHERE tenant_id = 1 ORDER BY created_at DESC");
        let ordering = refs.columns_with_usage(ColumnUsage::Ordering);
        assert_eq!(ordering.len(), 1);
        assert_eq!(&*ordering[0], "created_at");
        assert_eq!(refs.projection.len(), 2);
    }

    #[test]
    fn test_star_projection_is_not_simple() {
        let refs = refs_of("SELECT * FROM contacts WHERE tenant_id = 1");
        assert!(refs.projection.is_empty());
    }

    #[test]
    fn test_join_columns_with_alias() {
        let refs = refs_of(
            "SELECT c.id FROM contacts c JOIN orders o ON c.id = o.contact_id WHERE c.tenant_id = 3",
        );
        let join = refs.columns_with_usage(ColumnUsage::Join);
        assert_eq!(join.len(), 1);
        assert_eq!(&*join[0], "id");
        let eq = refs.columns_with_usage(ColumnUsage::Equality);
        assert_eq!(eq.len(), 1);
        assert_eq!(&*eq[0], "tenant_id");
    }

    #[test]
    fn test_update_and_delete_are_writes() {
        let update = refs_of("UPDATE contacts SET email = 'x' WHERE id = 4");
        assert!(update.is_write);
        assert_eq!(&**update.table.as_ref().unwrap(), "contacts");
        let eq = update.columns_with_usage(ColumnUsage::Equality);
        assert!(eq.iter().any(|c| &**c == "id"));

        let delete = refs_of("DELETE FROM contacts WHERE tenant_id = 1 AND id IN (1, 2)");
        assert!(delete.is_write);
        let eq = delete.columns_with_usage(ColumnUsage::Equality);
        assert_eq!(eq.len(), 2);
    }

    #[test]
    fn test_unparseable_statement_is_harmless() {
        let refs = parse(&QueryFingerprint::from_normalized("begin".to_owned()));
        assert!(refs.table.is_none());
        assert!(refs.refs.is_empty());
    }
}
