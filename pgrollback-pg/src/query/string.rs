//! SQL string utilities: quoting, statement splitting and parameter
//! rendering for the simple-protocol execution path.

use pgrollback_core::err::{bail, Result};

/// Quotes an identifier for use in SQL
pub fn pg_quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes a string value as a SQL literal
pub fn pg_str_literal(val: &str) -> String {
    if val.contains('\\') {
        format!("E'{}'", val.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", val.replace('\'', "''"))
    }
}

/// The lexical state of a SQL scanner position
#[derive(PartialEq)]
enum Lex {
    Normal,
    SingleQuote,
    DoubleQuote,
    DollarQuote(String),
    LineComment,
    BlockComment,
}

/// Splits a multi-statement SQL string on statement boundaries.
///
/// Semicolons inside single-quoted, double-quoted and dollar-quoted
/// strings or comments do not split. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = vec![];
    let mut current = String::new();
    let mut state = Lex::Normal;
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match &state {
            Lex::Normal => match c {
                ';' => {
                    let stmt = current.trim();
                    if !stmt.is_empty() {
                        statements.push(stmt.to_string());
                    }
                    current.clear();
                    i += 1;
                    continue;
                }
                '\'' => state = Lex::SingleQuote,
                '"' => state = Lex::DoubleQuote,
                '$' => {
                    if let Some(tag) = dollar_tag(&chars[i..]) {
                        current.push_str(&tag);
                        i += tag.chars().count();
                        state = Lex::DollarQuote(tag);
                        continue;
                    }
                }
                '-' if next == Some('-') => state = Lex::LineComment,
                '/' if next == Some('*') => state = Lex::BlockComment,
                _ => {}
            },
            Lex::SingleQuote => {
                if c == '\'' {
                    state = Lex::Normal;
                }
            }
            Lex::DoubleQuote => {
                if c == '"' {
                    state = Lex::Normal;
                }
            }
            Lex::DollarQuote(tag) => {
                if c == '$' && starts_with(&chars[i..], tag) {
                    let tag = tag.clone();
                    current.push_str(&tag);
                    i += tag.chars().count();
                    state = Lex::Normal;
                    continue;
                }
            }
            Lex::LineComment => {
                if c == '\n' {
                    state = Lex::Normal;
                }
            }
            Lex::BlockComment => {
                if c == '*' && next == Some('/') {
                    current.push('*');
                    current.push('/');
                    i += 2;
                    state = Lex::Normal;
                    continue;
                }
            }
        }

        current.push(c);
        i += 1;
    }

    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }

    statements
}

/// Substitutes `$1..$n` placeholders with the rendered parameter values.
///
/// Placeholders inside quoted strings are left alone. A placeholder
/// referencing a parameter that was not bound is an error.
pub fn substitute_params(sql: &str, params: &[Option<String>]) -> Result<String> {
    let mut out = String::with_capacity(sql.len());
    let mut state = Lex::Normal;
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match &state {
            Lex::Normal => match c {
                '\'' => state = Lex::SingleQuote,
                '"' => state = Lex::DoubleQuote,
                '$' if next.map(|n| n.is_ascii_digit()).unwrap_or(false) => {
                    let mut digits = String::new();
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        digits.push(chars[j]);
                        j += 1;
                    }

                    let idx: usize = digits.parse().unwrap();
                    if idx == 0 || idx > params.len() {
                        bail!("Statement references parameter ${} but only {} were bound", idx, params.len());
                    }

                    match &params[idx - 1] {
                        Some(value) => out.push_str(&pg_str_literal(value)),
                        None => out.push_str("NULL"),
                    }

                    i = j;
                    continue;
                }
                '$' => {
                    if let Some(tag) = dollar_tag(&chars[i..]) {
                        out.push_str(&tag);
                        i += tag.chars().count();
                        state = Lex::DollarQuote(tag);
                        continue;
                    }
                }
                '-' if next == Some('-') => state = Lex::LineComment,
                '/' if next == Some('*') => state = Lex::BlockComment,
                _ => {}
            },
            Lex::SingleQuote => {
                if c == '\'' {
                    state = Lex::Normal;
                }
            }
            Lex::DoubleQuote => {
                if c == '"' {
                    state = Lex::Normal;
                }
            }
            Lex::DollarQuote(tag) => {
                if c == '$' && starts_with(&chars[i..], tag) {
                    let tag = tag.clone();
                    out.push_str(&tag);
                    i += tag.chars().count();
                    state = Lex::Normal;
                    continue;
                }
            }
            Lex::LineComment => {
                if c == '\n' {
                    state = Lex::Normal;
                }
            }
            Lex::BlockComment => {
                if c == '*' && next == Some('/') {
                    out.push('*');
                    out.push('/');
                    i += 2;
                    state = Lex::Normal;
                    continue;
                }
            }
        }

        out.push(c);
        i += 1;
    }

    Ok(out)
}

/// The highest `$n` placeholder referenced outside quoted strings
pub fn count_placeholders(sql: &str) -> usize {
    let mut max = 0;
    let mut state = Lex::Normal;
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match &state {
            Lex::Normal => match c {
                '\'' => state = Lex::SingleQuote,
                '"' => state = Lex::DoubleQuote,
                '$' if next.map(|n| n.is_ascii_digit()).unwrap_or(false) => {
                    let mut digits = String::new();
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        digits.push(chars[j]);
                        j += 1;
                    }

                    max = max.max(digits.parse().unwrap_or(0));
                    i = j;
                    continue;
                }
                '$' => {
                    if let Some(tag) = dollar_tag(&chars[i..]) {
                        i += tag.chars().count();
                        state = Lex::DollarQuote(tag);
                        continue;
                    }
                }
                '-' if next == Some('-') => state = Lex::LineComment,
                '/' if next == Some('*') => state = Lex::BlockComment,
                _ => {}
            },
            Lex::SingleQuote => {
                if c == '\'' {
                    state = Lex::Normal;
                }
            }
            Lex::DoubleQuote => {
                if c == '"' {
                    state = Lex::Normal;
                }
            }
            Lex::DollarQuote(tag) => {
                if c == '$' && starts_with(&chars[i..], tag) {
                    let len = tag.chars().count();
                    i += len;
                    state = Lex::Normal;
                    continue;
                }
            }
            Lex::LineComment => {
                if c == '\n' {
                    state = Lex::Normal;
                }
            }
            Lex::BlockComment => {
                if c == '*' && next == Some('/') {
                    i += 2;
                    state = Lex::Normal;
                    continue;
                }
            }
        }

        i += 1;
    }

    max
}

/// Reads a `$tag$` dollar-quote delimiter starting at the supplied
/// position, if one is present.
fn dollar_tag(chars: &[char]) -> Option<String> {
    debug_assert_eq!(chars[0], '$');

    let mut tag = String::from('$');
    for c in chars[1..].iter() {
        match c {
            '$' => {
                tag.push('$');
                return Some(tag);
            }
            c if c.is_ascii_alphanumeric() || *c == '_' => tag.push(*c),
            _ => return None,
        }
    }

    None
}

fn starts_with(chars: &[char], tag: &str) -> bool {
    let tag: Vec<char> = tag.chars().collect();
    chars.len() >= tag.len() && chars[..tag.len()] == tag[..]
}

/// Derives the session's advisory lock key as a stable 64-bit FNV-1a hash
/// over `pgtest_<test_id>`
pub fn advisory_lock_key(test_id: &str) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in b"pgtest_".iter().chain(test_id.as_bytes()) {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash as i64
}

/// Normalises a backend command tag for client compatibility.
///
/// `INSERT` tags report an object id of zero on modern servers; clients of
/// this proxy expect the bare `INSERT <rows>` form.
pub fn normalise_command_tag(tag: &str) -> String {
    let parts: Vec<&str> = tag.split(' ').collect();

    if parts.len() == 3 && parts[0] == "INSERT" && parts[1] == "0" {
        return format!("INSERT {}", parts[2]);
    }

    tag.to_string()
}
