//! # Expression compiler
//!
//! Lowers `Expression` IR into compiled evaluator closures (spec.md §4.3).
//! Compilation dispatches once, at compile time, on node shape; the
//! returned closure itself does no further dispatch on the hot path -
//! each sub-expression is already a concrete closure capturing its
//! compiled arguments.

use crate::errors::CompileError;
use crate::ir::{AggregateFunc, Expression, FuncName};
use crate::value::{Record, Value};
use regex::RegexBuilder;
use std::collections::HashMap;
use std::rc::Rc;

/// `(row: {alias -> record}) -> value` (spec.md §4.3).
pub type NamespacedEvaluator = Rc<dyn Fn(&HashMap<String, Record>) -> Value>;
/// `(record) -> value` (spec.md §4.3), used once a pipeline stage has
/// unwrapped to a single source.
pub type SingleRowEvaluator = Rc<dyn Fn(&Record) -> Value>;

/// Compiles an expression into a namespaced evaluator, usable wherever
/// multiple aliases are still in scope (WHERE, JOIN keys, GROUP BY,
/// ORDER BY before the final SELECT collapses the row).
pub fn compile_namespaced(expr: &Expression) -> Result<NamespacedEvaluator, CompileError> {
    match expr {
        Expression::Val(v) => {
            let v = v.clone();
            Ok(Rc::new(move |_row| v.clone()))
        }
        Expression::PropRef(path) => {
            if path.is_empty() {
                return Err(CompileError::EmptyReferencePath);
            }
            let alias = path[0].clone();
            let field = path.get(1).cloned();
            Ok(Rc::new(move |row: &HashMap<String, Record>| match row.get(&alias) {
                Some(record) => match &field {
                    Some(f) => record.get(f).cloned().unwrap_or(Value::Null),
                    None => Value::Null,
                },
                None => Value::Null,
            }))
        }
        Expression::ResultRef(name) => {
            let name = name.clone();
            Ok(Rc::new(move |row: &HashMap<String, Record>| {
                row.get("result")
                    .and_then(|record| record.get(&name))
                    .cloned()
                    .unwrap_or(Value::Null)
            }))
        }
        Expression::Func { name, args } => {
            let compiled: Vec<NamespacedEvaluator> = args
                .iter()
                .map(compile_namespaced)
                .collect::<Result<_, _>>()?;
            let name = *name;
            Ok(Rc::new(move |row: &HashMap<String, Record>| {
                let values: Vec<Value> = compiled.iter().map(|f| f(row)).collect();
                eval_func(name, &values)
            }))
        }
        Expression::Aggregate { .. } => Err(CompileError::AggregateFunctionNotInSelect(
            "aggregate referenced outside SELECT/HAVING rewrite".to_string(),
        )),
    }
}

/// Compiles an expression that only ever sees a single, already-unwrapped
/// record (spec.md §4.3's single-row evaluator shape). `PropRef`s must be
/// `[alias, field]`; the alias component is ignored since the row is no
/// longer namespaced.
pub fn compile_single_row(expr: &Expression) -> Result<SingleRowEvaluator, CompileError> {
    match expr {
        Expression::Val(v) => {
            let v = v.clone();
            Ok(Rc::new(move |_record| v.clone()))
        }
        Expression::PropRef(path) => {
            if path.is_empty() {
                return Err(CompileError::EmptyReferencePath);
            }
            let field = path.last().cloned().unwrap();
            Ok(Rc::new(move |record: &Record| record.get(&field).cloned().unwrap_or(Value::Null)))
        }
        Expression::ResultRef(name) => {
            let name = name.clone();
            Ok(Rc::new(move |record: &Record| record.get(&name).cloned().unwrap_or(Value::Null)))
        }
        Expression::Func { name, args } => {
            let compiled: Vec<SingleRowEvaluator> = args
                .iter()
                .map(compile_single_row)
                .collect::<Result<_, _>>()?;
            let name = *name;
            Ok(Rc::new(move |record: &Record| {
                let values: Vec<Value> = compiled.iter().map(|f| f(record)).collect();
                eval_func(name, &values)
            }))
        }
        Expression::Aggregate { .. } => Err(CompileError::AggregateFunctionNotInSelect(
            "aggregate referenced outside SELECT/HAVING rewrite".to_string(),
        )),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Timestamp(_) => true,
    }
}

fn arith(op: FuncName, a: &Value, b: &Value) -> Value {
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Value::Null;
    };
    match op {
        FuncName::Add => Value::Float(x + y),
        FuncName::Subtract => Value::Float(x - y),
        FuncName::Multiply => Value::Float(x * y),
        FuncName::Divide => {
            if y == 0.0 {
                Value::Null
            } else {
                Value::Float(x / y)
            }
        }
        _ => unreachable!(),
    }
}

/// Translates a SQL `LIKE`/`ILIKE` pattern to an anchored regex (spec.md
/// §4.3): escape every regex metacharacter except `%` and `_`, then
/// `%` -> `.*`, `_` -> `.`.
pub fn like_pattern_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    let translated = escaped.replace('%', ".*").replace('_', ".");
    format!("^{translated}$")
}

fn eval_func(name: FuncName, args: &[Value]) -> Value {
    use FuncName::*;
    match name {
        Eq => {
            if args[0].is_null() || args[1].is_null() {
                Value::Null
            } else {
                Value::Bool(args[0] == args[1])
            }
        }
        Gt | Gte | Lt | Lte => {
            if args[0].is_null() || args[1].is_null() {
                return Value::Null;
            }
            match args[0].compare_non_null(&args[1], false) {
                Some(ord) => Value::Bool(match name {
                    Gt => ord == std::cmp::Ordering::Greater,
                    Gte => ord != std::cmp::Ordering::Less,
                    Lt => ord == std::cmp::Ordering::Less,
                    Lte => ord != std::cmp::Ordering::Greater,
                    _ => unreachable!(),
                }),
                None => Value::Bool(false),
            }
        }
        And => Value::Bool(args.iter().all(truthy)),
        Or => Value::Bool(args.iter().any(truthy)),
        Not => Value::Bool(!truthy(&args[0])),
        In => {
            let needle = &args[0];
            let candidates: Vec<&Value> = if args.len() == 2 {
                if let Value::Array(items) = &args[1] {
                    items.iter().collect()
                } else {
                    vec![&args[1]]
                }
            } else {
                args[1..].iter().collect()
            };
            Value::Bool(candidates.into_iter().any(|c| c == needle))
        }
        Like | Ilike => {
            let (Some(subject), Some(pattern)) = (args[0].as_str(), args[1].as_str()) else {
                return Value::Bool(false);
            };
            let regex_str = like_pattern_to_regex(pattern);
            let Ok(re) = RegexBuilder::new(&regex_str)
                .case_insensitive(matches!(name, Ilike))
                .build()
            else {
                return Value::Bool(false);
            };
            Value::Bool(re.is_match(subject))
        }
        Upper => match args[0].as_str() {
            Some(s) => Value::String(s.to_uppercase()),
            None => Value::Null,
        },
        Lower => match args[0].as_str() {
            Some(s) => Value::String(s.to_lowercase()),
            None => Value::Null,
        },
        Length => Value::Int(args[0].length()),
        Concat => Value::String(args.iter().map(Value::coerce_to_string).collect()),
        Coalesce => args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null),
        Add | Subtract | Multiply | Divide => arith(name, &args[0], &args[1]),
    }
}

/// Incremental accumulator for the `groupBy` aggregates (spec.md §4.1,
/// §4.5 step 5): `sum/count/avg` only need running totals; `min/max` need
/// a value multiset so removing the current extreme can fall back to the
/// next one in O(log n).
#[derive(Debug, Default, Clone)]
pub struct AggregateState {
    pub count: i64,
    pub sum: f64,
    multiset: std::collections::BTreeMap<crate::fractional_index::FloatOrd, i64>,
}

impl AggregateState {
    pub fn add(&mut self, value: &Value, mult: i64) {
        self.count += mult;
        self.sum += value.as_f64().unwrap_or(0.0) * mult as f64;
        let key = crate::fractional_index::FloatOrd(value.as_f64().unwrap_or(0.0));
        *self.multiset.entry(key).or_insert(0) += mult;
        if self.multiset.get(&key) == Some(&0) {
            self.multiset.remove(&key);
        }
    }

    pub fn finish(&self, func: AggregateFunc) -> Value {
        match func {
            AggregateFunc::Count => Value::Int(self.count.max(0)),
            AggregateFunc::Sum => Value::Float(self.sum),
            AggregateFunc::Avg => {
                if self.count > 0 {
                    Value::Float(self.sum / self.count as f64)
                } else {
                    Value::Null
                }
            }
            AggregateFunc::Min => self
                .multiset
                .keys()
                .next()
                .map(|k| Value::Float(k.0))
                .unwrap_or(Value::Null),
            AggregateFunc::Max => self
                .multiset
                .keys()
                .next_back()
                .map(|k| Value::Float(k.0))
                .unwrap_or(Value::Null),
        }
    }
}
