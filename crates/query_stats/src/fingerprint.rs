//! SQL fingerprinting: literals become `?`, whitespace collapses, comments
//! disappear, keywords are lowercased, identifiers are left alone. Two
//! statements differing only in literals share a fingerprint; column order is
//! significant, so `SELECT a, b` and `SELECT b, a` do not.
use common::types::QueryFingerprint;

const KEYWORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "insert", "into", "values", "update", "set",
    "delete", "join", "inner", "left", "right", "full", "outer", "cross", "on", "using", "order",
    "by", "group", "having", "limit", "offset", "as", "distinct", "union", "all", "in", "is",
    "null", "like", "ilike", "between", "exists", "case", "when", "then", "else", "end", "asc",
    "desc", "count", "sum", "avg", "min", "max", "cast", "with", "returning", "for",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| word.eq_ignore_ascii_case(k))
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn push_token(out: &mut String, pending_space: &mut bool, token: &str) {
    if *pending_space && !out.is_empty() {
        out.push(' ');
    }
    out.push_str(token);
    *pending_space = false;
}

pub fn fingerprint(raw_sql: &str) -> QueryFingerprint {
    let mut out = String::with_capacity(raw_sql.len());
    let mut chars = raw_sql.chars().peekable();
    let mut pending_space = false;

    while let Some(&c) = chars.peek() {
        match c {
            _ if c.is_whitespace() => {
                chars.next();
                pending_space = true;
            },
            // Line comment.
            '-' => {
                chars.next();
                if chars.peek() == Some(&'-') {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                    pending_space = true;
                } else {
                    push_token(&mut out, &mut pending_space, "-");
                }
            },
            // Block comment.
            '/' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    let mut prev = ' ';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                    pending_space = true;
                } else {
                    push_token(&mut out, &mut pending_space, "/");
                }
            },
            // String literal, with '' escaping.
            '\'' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                            } else {
                                break;
                            }
                        },
                        Some(_) => {},
                        None => break,
                    }
                }
                push_token(&mut out, &mut pending_space, "?");
            },
            // Positional parameter ($1, $2, ...).
            '$' => {
                chars.next();
                while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                    chars.next();
                }
                push_token(&mut out, &mut pending_space, "?");
            },
            // Numeric literal.
            _ if c.is_ascii_digit() => {
                while chars
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_')
                {
                    chars.next();
                }
                push_token(&mut out, &mut pending_space, "?");
            },
            // Quoted identifier: quotes are kept so renormalizing is a no-op.
            '"' => {
                chars.next();
                let mut word = String::new();
                for c in chars.by_ref() {
                    if c == '"' {
                        break;
                    }
                    word.push(c);
                }
                push_token(&mut out, &mut pending_space, &format!("\"{word}\""));
            },
            // Word: keyword or identifier.
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while chars.peek().is_some_and(|c| is_ident_char(*c)) {
                    word.push(chars.next().expect("peeked"));
                }
                if is_keyword(&word) {
                    push_token(&mut out, &mut pending_space, &word.to_ascii_lowercase());
                } else {
                    push_token(&mut out, &mut pending_space, &word);
                }
            },
            // Punctuation and operators pass through.
            _ => {
                chars.next();
                if pending_space && !out.is_empty() {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(c);
            },
        }
    }
    QueryFingerprint::from_normalized(out)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::fingerprint;

    #[test]
    fn test_literals_collapse() {
        let a = fingerprint("SELECT * FROM contacts WHERE tenant_id = 42 AND email = 'a@b.c'");
        let b = fingerprint("select  *  from contacts where tenant_id=7 and email='x@y.z'");
        assert_eq!(a.as_str(), b.as_str());
        assert_eq!(
            a.as_str(),
            "select * from contacts where tenant_id = ? and email = ?"
        );
    }

    #[test]
    fn test_positional_params_normalize() {
        let a = fingerprint("SELECT id FROM t WHERE a = $1 AND b = $2");
        let b = fingerprint("SELECT id FROM t WHERE a = 5 AND b = 'q'");
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_comments_are_stripped() {
        let a = fingerprint("SELECT a FROM t -- trailing\nWHERE a = 1");
        let b = fingerprint("SELECT a /* inline */ FROM t WHERE a = 2");
        assert_eq!(a.as_str(), "select a from t where a = ?");
        assert_eq!(b.as_str(), "select a from t where a = ?");
    }

    #[test]
    fn test_identifier_case_is_preserved() {
        let fp = fingerprint("SELECT TenantId FROM Contacts WHERE TenantId = 9");
        assert_eq!(fp.as_str(), "select TenantId from Contacts where TenantId = ?");
    }

    #[test]
    fn test_projection_order_is_significant() {
        let ab = fingerprint("SELECT a, b FROM t");
        let ba = fingerprint("SELECT b, a FROM t");
        assert_ne!(ab.as_str(), ba.as_str());
    }

    #[test]
    fn test_escaped_quote_inside_literal() {
        let fp = fingerprint("SELECT a FROM t WHERE name = 'O''Brien'");
        assert_eq!(fp.as_str(), "select a from t where name = ?");
    }

    proptest! {
        // Fingerprinting is deterministic and idempotent: normalizing a
        // fingerprint's own text is a fixed point.
        #[test]
        fn proptest_fingerprint_idempotent(sql in "[ -~]{0,120}") {
            let once = fingerprint(&sql);
            let twice = fingerprint(once.as_str());
            prop_assert_eq!(once.as_str(), twice.as_str());
        }
    }
}
