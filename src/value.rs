//! # Value Type System
//!
//! JSON-compatible scalars plus timestamps (spec.md §4.2: "Values are
//! JSON-compatible scalars plus timestamps"). `Record` is the opaque
//! field->value mapping applications register; `Key` is the scalar identity
//! a source collection assigns to each record via `getKey`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// A single field value. Closed, tagged variant set - no open polymorphism,
/// matching the "Tagged variants over inheritance" design note.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Best-effort numeric coercion used by arithmetic and aggregate
    /// evaluation (spec.md §4.3: "treating null as 0").
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Null => Some(0.0),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Character/element count per spec.md §4.3 `length`: strings count
    /// characters, arrays count elements, everything else is 0.
    pub fn length(&self) -> i64 {
        match self {
            Value::String(s) => s.chars().count() as i64,
            Value::Array(items) => items.len() as i64,
            _ => 0,
        }
    }

    /// Safe string coercion for `concat` (spec.md §4.3): null -> empty,
    /// otherwise a JSON-ish fallback.
    pub fn coerce_to_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Timestamp(t) => t.to_rfc3339(),
            Value::Array(_) => serde_json::to_string(&self.to_json()).unwrap_or_default(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::json!(f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    /// Total ordering used by ORDER BY. Returns `None` when the two values
    /// are not comparable (different non-numeric types); callers fall back
    /// to the nulls/string-sort rules around this.
    pub fn compare_non_null(&self, other: &Value, locale_numeric: bool) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(if locale_numeric {
                natural_compare(a, b)
            } else {
                a.cmp(b)
            }),
            _ => None,
        }
    }
}

/// Code-point (lexical) compare is just `str::cmp`. Locale compare here
/// approximates "numeric collation" (spec.md §4.5 step 7: `locale` uses
/// numeric collation) by comparing embedded digit runs numerically.
fn natural_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let na = take_number(&mut ai);
                    let nb = take_number(&mut bi);
                    match na.cmp(&nb) {
                        std::cmp::Ordering::Equal => continue,
                        other => return other,
                    }
                } else {
                    match ca.cmp(cb) {
                        std::cmp::Ordering::Equal => {
                            ai.next();
                            bi.next();
                            continue;
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_number(it: &mut std::iter::Peekable<std::str::Chars>) -> u64 {
    let mut n: u64 = 0;
    while let Some(c) = it.peek() {
        if c.is_ascii_digit() {
            n = n * 10 + (*c as u64 - '0' as u64);
            it.next();
        } else {
            break;
        }
    }
    n
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.coerce_to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A record's stable scalar identity within its source collection
/// (spec.md §3: "Key is a scalar (string or integer)").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    String(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}
impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::String(v.to_string())
    }
}
impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::String(v)
    }
}

/// Opaque field->value mapping (spec.md §3: "Record. An opaque mapping from
/// field name to value").
pub type Record = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_float_equality_is_numeric() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
    }

    #[test]
    fn length_by_shape() {
        assert_eq!(Value::String("héllo".into()).length(), 5);
        assert_eq!(Value::Array(vec![Value::Null, Value::Null]).length(), 2);
        assert_eq!(Value::Int(5).length(), 0);
    }

    #[test]
    fn coerce_to_string_nulls_to_empty() {
        assert_eq!(Value::Null.coerce_to_string(), "");
    }

    #[test]
    fn ordering_numeric_cross_type() {
        assert_eq!(
            Value::Int(1).compare_non_null(&Value::Float(2.0), false),
            Some(std::cmp::Ordering::Less)
        );
    }

    #[test]
    fn natural_compare_orders_embedded_numbers() {
        assert_eq!(natural_compare("item2", "item10"), std::cmp::Ordering::Less);
        assert_eq!(natural_compare("item10", "item2"), std::cmp::Ordering::Greater);
    }
}
