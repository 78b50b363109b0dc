//! `{name}` placeholder substitution.
//!
//! `{{` and `}}` produce literal braces. Brace groups whose contents are not a plain
//! identifier (for example inline JSON) are copied through untouched.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

enum Piece<'a> {
    Text(&'a str),
    Brace(char),
    Var(&'a str),
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn pieces(template: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let bytes = template.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push(Piece::Text(&template[start..i]));
                out.push(Piece::Brace('{'));
                i += 2;
                start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push(Piece::Text(&template[start..i]));
                out.push(Piece::Brace('}'));
                i += 2;
                start = i;
            }
            b'{' => match template[i + 1..].find('}') {
                Some(rel) if is_ident(&template[i + 1..i + 1 + rel]) => {
                    out.push(Piece::Text(&template[start..i]));
                    out.push(Piece::Var(&template[i + 1..i + 1 + rel]));
                    i += rel + 2;
                    start = i;
                }
                _ => i += 1,
            },
            _ => i += 1,
        }
    }
    out.push(Piece::Text(&template[start..]));
    out
}

/// Placeholder names in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for p in pieces(template) {
        if let Piece::Var(name) = p {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Stringify a variable value the way it should appear in a prompt.
pub fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every placeholder with the matching variable.
///
/// Fails on the first placeholder that has no variable.
pub fn interpolate(
    template: &str,
    variables: &BTreeMap<String, Value>,
    sample_index: usize,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    for p in pieces(template) {
        match p {
            Piece::Text(t) => out.push_str(t),
            Piece::Brace(c) => out.push(c),
            Piece::Var(name) => {
                let value = variables.get(name).ok_or_else(|| Error::MissingVariable {
                    name: name.to_string(),
                    sample_index,
                })?;
                out.push_str(&render_value(value));
            }
        }
    }
    Ok(out)
}
