//! Validated SQL identifiers. DDL is assembled exclusively from these
//! newtypes; a raw string never reaches statement text.
use std::{
    fmt,
    ops::Deref,
    str::FromStr,
};

use anyhow::Context;
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

/// Postgres truncates identifiers beyond this.
pub const MAX_IDENTIFIER_LEN: usize = 63;

pub fn check_valid_identifier(s: &str) -> anyhow::Result<()> {
    let mut chars = s.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
        _ => false,
    };
    if !valid || s.len() > MAX_IDENTIFIER_LEN {
        // The offending string stays out of the error by contract.
        anyhow::bail!(ErrorMetadata::invalid_identifier());
    }
    Ok(())
}

macro_rules! identifier_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                check_valid_identifier(s)?;
                Ok(Self(s.to_owned()))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> Self {
                v.0
            }
        }
    };
}

identifier_newtype!(
    /// A table name, optionally schema-qualified at display sites.
    TableName
);
identifier_newtype!(
    /// A column name.
    ColumnName
);
identifier_newtype!(
    /// The name of an index managed (or observed) by the daemon.
    IndexName
);

/// Parse an identifier, attaching the table context to configuration errors
/// for the operator log (the identifier itself is not echoed).
pub fn parse_column(table: &TableName, s: &str) -> anyhow::Result<ColumnName> {
    s.parse()
        .with_context(|| format!("invalid column identifier on table {table}"))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        check_valid_identifier,
        ColumnName,
        TableName,
    };

    #[test]
    fn test_accepts_ordinary_identifiers() {
        for ok in ["contacts", "_ix", "a1_b2", "Tenant_ID"] {
            assert!(check_valid_identifier(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn test_rejects_injection_shapes() {
        for bad in [
            "",
            "1abc",
            "users; DROP TABLE users",
            "a-b",
            "a b",
            "\"quoted\"",
            "emoji🙂",
            &"x".repeat(64),
        ] {
            assert!(check_valid_identifier(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_newtype_roundtrip() {
        let t: TableName = "contacts".parse().unwrap();
        let c: ColumnName = "email".parse().unwrap();
        assert_eq!(format!("{t}.{c}"), "contacts.email");
        assert!("bad name".parse::<TableName>().is_err());
    }

    proptest! {
        #[test]
        fn proptest_valid_identifiers_parse(s in "[A-Za-z_][A-Za-z0-9_]{0,62}") {
            prop_assert!(check_valid_identifier(&s).is_ok());
        }

        #[test]
        fn proptest_no_panic_on_arbitrary_input(s in ".*") {
            let _ = check_valid_identifier(&s);
        }
    }
}
