//! Codec for python dict literals emitted by the image featurizer, e.g.
//! `{'0': 'dog', '1': 'frisbee'}`.

use serde_json::Value;

use crate::error::{IngestError, Result};

/// Rewrites a python literal into JSON: single-quoted strings become
/// double-quoted and `None`/`True`/`False` become their JSON spellings.
pub fn to_json(literal: &str) -> Result<String> {
    let chars: Vec<char> = literal.chars().collect();
    let mut out = String::with_capacity(literal.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\'' => {
                i += 1;
                out.push('"');
                loop {
                    match chars.get(i) {
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('\'') => out.push('\''),
                                Some(c) => {
                                    out.push('\\');
                                    out.push(*c);
                                }
                                None => return Err(malformed(literal, "dangling escape")),
                            }
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some('"') => {
                            out.push_str("\\\"");
                            i += 1;
                        }
                        Some(c) => {
                            out.push(*c);
                            i += 1;
                        }
                        None => return Err(malformed(literal, "unterminated string")),
                    }
                }
                out.push('"');
            }
            '"' => {
                out.push('"');
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\\') => {
                            out.push('\\');
                            if let Some(c) = chars.get(i + 1) {
                                out.push(*c);
                            }
                            i += 2;
                        }
                        Some('"') => {
                            out.push('"');
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            out.push(*c);
                            i += 1;
                        }
                        None => return Err(malformed(literal, "unterminated string")),
                    }
                }
            }
            c if c.is_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "None" => out.push_str("null"),
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    other => out.push_str(other),
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

pub fn parse(literal: &str) -> Result<Value> {
    let json = to_json(literal)?;
    serde_json::from_str(&json).map_err(|e| malformed(literal, &e.to_string()))
}

/// Flattens the values of a dict literal into one comma separated string.
/// Numeric keys are visited in numeric order.
pub fn joined_values(literal: &str) -> Result<String> {
    let value = parse(literal)?;
    let mut parts = Vec::new();
    flatten(&value, &mut parts);
    Ok(parts.join(","))
}

fn flatten(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => parts.push(s.clone()),
        Value::Bool(b) => parts.push(b.to_string()),
        Value::Number(n) => parts.push(n.to_string()),
        Value::Array(items) => items.iter().for_each(|item| flatten(item, parts)),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| match (a.parse::<i64>(), b.parse::<i64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => a.cmp(b),
            });
            for key in keys {
                flatten(&map[key.as_str()], parts);
            }
        }
    }
}

fn malformed(literal: &str, message: &str) -> IngestError {
    IngestError::csv(format!("malformed dict literal '{}': {}", literal, message))
}
