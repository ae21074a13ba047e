//! Index naming: `ix_<table>_<col1>[_<col2>...][_p<predicate-hash>][_<method>]`,
//! clamped to the identifier length limit and disambiguated with a short
//! descriptor hash on truncation or collision.
use common::{
    identifier::{
        IndexName,
        MAX_IDENTIFIER_LEN,
    },
    types::{
        IndexCandidate,
        IndexMethod,
    },
};
use sha2::{
    Digest,
    Sha256,
};

fn descriptor_hash(candidate: &IndexCandidate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(candidate.table.as_bytes());
    for column in &candidate.columns {
        hasher.update(b".");
        hasher.update(column.as_bytes());
    }
    if let Some(predicate) = &candidate.predicate {
        hasher.update(b"|");
        hasher.update(predicate.as_bytes());
    }
    hasher.update(candidate.method.sql_method().as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

pub fn index_name(candidate: &IndexCandidate, taken: &[IndexName]) -> IndexName {
    let mut base = format!("ix_{}", candidate.table);
    for column in &candidate.columns {
        base.push('_');
        base.push_str(column);
    }
    if candidate.predicate.is_some() {
        base.push_str("_p");
        base.push_str(&descriptor_hash(candidate)[..6]);
    }
    if candidate.method != IndexMethod::Ordered {
        base.push('_');
        base.push_str(candidate.method.sql_method());
    }

    let clamp = |name: &str| -> String {
        if name.len() <= MAX_IDENTIFIER_LEN {
            return name.to_owned();
        }
        let hash = descriptor_hash(candidate);
        format!("{}_{hash}", &name[..MAX_IDENTIFIER_LEN - hash.len() - 1])
    };
    let mut name = clamp(&base);
    if taken.iter().any(|t| **t == name) {
        name = clamp(&format!("{base}_{}", descriptor_hash(candidate)));
    }
    name.parse().expect("generated name is a valid identifier")
}
