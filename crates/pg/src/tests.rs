use common::{
    db::{
        RowSet,
        SqlValue,
    },
    types::{
        Constraint,
        IndexDefinition,
        IndexMethod,
    },
};

use crate::{
    build_create_index_sql,
    classify_error,
    parse_catalog_entry,
    parse_live_index,
};

fn definition(predicate: Option<&str>) -> IndexDefinition {
    IndexDefinition {
        name: "ix_contacts_tenant_id_email".parse().unwrap(),
        table: "contacts".parse().unwrap(),
        columns: vec!["tenant_id".parse().unwrap(), "email".parse().unwrap()],
        predicate: predicate.map(str::to_owned),
        method: IndexMethod::Ordered,
    }
}

#[test]
fn test_create_index_sql_shape() {
    let sql = build_create_index_sql(&definition(None), true);
    assert_eq!(
        sql,
        "CREATE INDEX CONCURRENTLY ix_contacts_tenant_id_email ON contacts USING btree \
         (tenant_id, email)"
    );
    let sql = build_create_index_sql(&definition(Some("deleted_at IS NULL")), false);
    assert!(sql.starts_with("CREATE INDEX ix_contacts_tenant_id_email"));
    assert!(sql.ends_with("WHERE deleted_at IS NULL"));
}

#[test]
fn test_classify_error_passes_through_non_driver_errors() {
    let e = classify_error(anyhow::anyhow!("not a database error"));
    assert_eq!(format!("{e}"), "not a database error");
}

#[test]
fn test_parse_live_index_row() {
    let rowset = RowSet {
        columns: vec![
            "index_name".into(),
            "table_name".into(),
            "method".into(),
            "valid".into(),
            "size_bytes".into(),
            "scan_count".into(),
            "last_used_epoch".into(),
            "predicate".into(),
            "column_list".into(),
            "bloat_fraction".into(),
        ],
        rows: vec![vec![
            SqlValue::Text("ix_contacts_email".into()),
            SqlValue::Text("contacts".into()),
            SqlValue::Text("btree".into()),
            SqlValue::Bool(true),
            SqlValue::Int(4096),
            SqlValue::Int(17),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Text("email".into()),
            SqlValue::Float(0.12),
        ]],
    };
    let ix = parse_live_index(&rowset, 0).unwrap().unwrap();
    assert_eq!(&*ix.name, "ix_contacts_email");
    assert_eq!(ix.columns.len(), 1);
    assert_eq!(ix.method, IndexMethod::Ordered);
    assert!(ix.valid);
    assert_eq!(ix.size_bytes, 4096);
    assert!((ix.bloat_fraction - 0.12).abs() < 1e-9);
}

#[test]
fn test_parse_live_index_skips_expression_indexes() {
    let rowset = RowSet {
        columns: vec![
            "index_name".into(),
            "table_name".into(),
            "method".into(),
            "valid".into(),
            "size_bytes".into(),
            "scan_count".into(),
            "last_used_epoch".into(),
            "predicate".into(),
            "column_list".into(),
            "bloat_fraction".into(),
        ],
        rows: vec![vec![
            SqlValue::Text("ix_expr".into()),
            SqlValue::Text("contacts".into()),
            SqlValue::Text("btree".into()),
            SqlValue::Bool(true),
            SqlValue::Int(0),
            SqlValue::Int(0),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Text("lower(email)".into()),
            SqlValue::Float(0.0),
        ]],
    };
    assert!(parse_live_index(&rowset, 0).unwrap().is_none());
}

#[test]
fn test_parse_catalog_entry_foreign_key() {
    let rowset = RowSet {
        columns: vec![
            "table_name".into(),
            "column_name".into(),
            "column_type".into(),
            "nullable".into(),
            "contype".into(),
            "fk_table".into(),
            "fk_column".into(),
        ],
        rows: vec![vec![
            SqlValue::Text("orders".into()),
            SqlValue::Text("customer_id".into()),
            SqlValue::Text("int8".into()),
            SqlValue::Bool(false),
            SqlValue::Text("f".into()),
            SqlValue::Text("customers".into()),
            SqlValue::Text("id".into()),
        ]],
    };
    let entry = parse_catalog_entry(&rowset, 0).unwrap();
    assert_eq!(&*entry.table, "orders");
    assert!(matches!(
        entry.constraint,
        Constraint::ForeignKey { ref target_table, .. } if &**target_table == "customers"
    ));
}
