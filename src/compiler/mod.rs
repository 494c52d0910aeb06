//! # Query compiler
//!
//! Lowers an optimized `Query` IR onto the dataflow runtime (spec.md
//! §4.5): FROM -> early SELECT -> WHERE -> JOINs -> GROUP BY/HAVING/late
//! SELECT -> ORDER BY/LIMIT/OFFSET -> fnSelect -> output. Sub-pipelines
//! for `QueryRef`s are cached by the *original* query identity from the
//! optimizer's `QueryMapping`, so two references to the same subquery
//! share one computation (spec.md §4.5, §9).

use crate::dataflow::{self, AggregateSpec, Batch, GroupByOperator, JoinOperator, Row, SourceBatch, TopKOperator};
use crate::errors::CompileError;
use crate::expr::{self, NamespacedEvaluator};
use crate::ir::{Expression, FromSource, JoinClause, NullsOrder, Query, SelectEntry, SortDirection, StringSort};
use crate::optimizer::QueryMapping;
use crate::value::{Record, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// What a plan node's output row should become once it reaches a
/// terminal extraction point (the query's own output, or a subquery
/// presenting itself as a single virtual record to its parent).
#[derive(Clone)]
enum FinalShape {
    Alias(String),
    EarlySelect,
    GroupResult,
}

fn compute_final_shape(query: &Query) -> FinalShape {
    if query.callbacks.fn_select.is_some() {
        FinalShape::EarlySelect
    } else if query.has_aggregates() {
        FinalShape::GroupResult
    } else if !query.select.is_empty() {
        FinalShape::EarlySelect
    } else {
        let alias = query.from.as_ref().map(|f| f.alias().to_string()).unwrap_or_default();
        FinalShape::Alias(alias)
    }
}

fn extract_final(row: &Row, shape: &FinalShape) -> Record {
    match shape {
        FinalShape::Alias(alias) => row.get(alias).cloned().unwrap_or_default(),
        FinalShape::EarlySelect => row.get("__select_results").cloned().unwrap_or_default(),
        FinalShape::GroupResult => row.get("result").cloned().unwrap_or_default(),
    }
}

enum PlanNode {
    Scan {
        collection: String,
        alias: String,
    },
    Filter {
        input: Box<PlanNode>,
        preds: Vec<NamespacedEvaluator>,
    },
    Project {
        input: Box<PlanNode>,
        entries: Vec<(String, NamespacedEvaluator)>,
    },
    Join {
        main: Box<PlanNode>,
        joined: Box<PlanNode>,
        op: RefCell<JoinOperator>,
        main_key: NamespacedEvaluator,
        joined_key: NamespacedEvaluator,
    },
    GroupBy {
        input: Box<PlanNode>,
        op: RefCell<GroupByOperator>,
        group_by: Vec<NamespacedEvaluator>,
        aggregates: Vec<AggregateSpec>,
        passthrough: Vec<(String, usize)>,
    },
    Having {
        input: Box<PlanNode>,
        preds: Vec<NamespacedEvaluator>,
    },
    OrderBy {
        input: Box<PlanNode>,
        op: RefCell<TopKOperator>,
        comparators: Vec<CompiledOrder>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    FnWhere {
        input: Box<PlanNode>,
        f: crate::ir::FnWhereCallback,
    },
    FnSelect {
        input: Box<PlanNode>,
        f: crate::ir::FnSelectCallback,
    },
    /// A previously-compiled subquery, referenced by its original
    /// identity for per-run memoization (spec.md §4.5's sub-pipeline
    /// cache). `shape` says how to collapse its output row down to the
    /// single record presented under `alias`.
    Cached {
        cache_key: usize,
        node: Rc<PlanNode>,
        shape: FinalShape,
        alias: String,
    },
}

struct CompiledOrder {
    eval: NamespacedEvaluator,
    direction: SortDirection,
    nulls: NullsOrder,
    string_sort: StringSort,
}

fn compare_with(entry: &CompiledOrder, a: &Row, b: &Row) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let av = (entry.eval)(a);
    let bv = (entry.eval)(b);
    let ord = match (av.is_null(), bv.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            return if entry.nulls == NullsOrder::First {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            return if entry.nulls == NullsOrder::First {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => av
            .compare_non_null(&bv, entry.string_sort == StringSort::Locale)
            .unwrap_or(Ordering::Equal),
    };
    if entry.direction == SortDirection::Desc {
        ord.reverse()
    } else {
        ord
    }
}

/// A compiled query, ready to be fed collection delta batches every run.
pub struct CompiledQuery {
    root: PlanNode,
    final_shape: FinalShape,
}

type Memo = HashMap<usize, Batch>;

impl CompiledQuery {
    /// Runs one incremental step: `deltas` maps collection id to its raw
    /// signed-multiset delta batch for this round. Returns the output
    /// batch of `(resultKey, resultRecord, multiplicity)` tuples (spec.md
    /// §4.5 step 9).
    pub fn run(&self, deltas: &HashMap<String, SourceBatch>) -> Vec<(String, Record, i64)> {
        let mut memo = Memo::new();
        let batch = eval_node(&self.root, deltas, &mut memo);
        let batch = dataflow::consolidate(batch);
        batch
            .into_iter()
            .map(|(key, row, mult)| (key, extract_final(&row, &self.final_shape), mult))
            .collect()
    }
}

fn eval_node(node: &PlanNode, deltas: &HashMap<String, SourceBatch>, memo: &mut Memo) -> Batch {
    match node {
        PlanNode::Scan { collection, alias } => match deltas.get(collection) {
            Some(batch) => batch
                .iter()
                .map(|(k, record, m)| {
                    let mut row = Row::new();
                    row.insert(alias.clone(), record.clone());
                    (k.clone(), row, *m)
                })
                .collect(),
            None => Batch::new(),
        },
        PlanNode::Filter { input, preds } => {
            let batch = eval_node(input, deltas, memo);
            dataflow::filter(batch, |_k, row| preds.iter().all(|p| expr_truthy(&p(row))))
        }
        PlanNode::Project { input, entries } => {
            let batch = eval_node(input, deltas, memo);
            dataflow::map(batch, |k, row| {
                let mut new_row = row.clone();
                let mut projected = Record::new();
                for (alias, eval) in entries {
                    projected.insert(alias.clone(), eval(row));
                }
                new_row.insert("__select_results".to_string(), projected);
                (k.to_string(), new_row)
            })
        }
        PlanNode::Join { main, joined, op, main_key, joined_key } => {
            let main_batch = eval_node(main, deltas, memo);
            let joined_batch = eval_node(joined, deltas, memo);
            let mut op = op.borrow_mut();
            let mut out = op.push_left(main_batch, &|row| main_key(row).coerce_to_string());
            out.extend(op.push_right(joined_batch, &|row| joined_key(row).coerce_to_string()));
            dataflow::consolidate(out)
        }
        PlanNode::GroupBy { input, op, group_by, aggregates, passthrough } => {
            let batch = eval_node(input, deltas, memo);
            let mut out = op.borrow_mut().push(batch, group_by, aggregates);
            for (_key, row, _mult) in &mut out {
                let group_key_rec = row.get("__group_key").cloned();
                if let Some(group_key_rec) = group_key_rec {
                    if let Some(result) = row.get_mut("result") {
                        for (alias, idx) in passthrough {
                            if let Some(v) = group_key_rec.get(&format!("__key_{idx}")) {
                                result.insert(alias.clone(), v.clone());
                            }
                        }
                    }
                }
            }
            out
        }
        PlanNode::Having { input, preds } => {
            let batch = eval_node(input, deltas, memo);
            dataflow::filter(batch, |_k, row| preds.iter().all(|p| expr_truthy(&p(row))))
        }
        PlanNode::OrderBy { input, op, comparators, limit, offset } => {
            let batch = eval_node(input, deltas, memo);
            let cmp = |a: &Row, b: &Row| {
                for c in comparators {
                    let ord = compare_with(c, a, b);
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            };
            let ordered = op.borrow_mut().apply(batch, &cmp);
            ordered
                .into_iter()
                .skip(offset.unwrap_or(0))
                .take(limit.unwrap_or(usize::MAX))
                .map(|(k, row)| (k, row, 1))
                .collect()
        }
        PlanNode::FnWhere { input, f } => {
            let batch = eval_node(input, deltas, memo);
            dataflow::filter(batch, |_k, row| f(row))
        }
        PlanNode::FnSelect { input, f } => {
            let batch = eval_node(input, deltas, memo);
            dataflow::map(batch, |k, row| {
                let mut new_row = row.clone();
                new_row.insert("__select_results".to_string(), f(row));
                (k.to_string(), new_row)
            })
        }
        PlanNode::Cached { cache_key, node: inner, shape, alias } => {
            if let Some(cached) = memo.get(cache_key) {
                return wrap_cached(cached, shape, alias);
            }
            let result = eval_node(inner, deltas, memo);
            memo.insert(*cache_key, result.clone());
            wrap_cached(&result, shape, alias)
        }
    }
}

fn wrap_cached(batch: &Batch, shape: &FinalShape, alias: &str) -> Batch {
    batch
        .iter()
        .map(|(k, row, m)| {
            let record = extract_final(row, shape);
            let mut ns = Row::new();
            ns.insert(alias.to_string(), record);
            (k.clone(), ns, *m)
        })
        .collect()
}

fn expr_truthy(v: &Value) -> bool {
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

/// Lowers a single collection/subquery `FromSource` into a `PlanNode` that
/// emits `(key, {alias: record})` tuples (spec.md §4.5 step 1).
fn compile_from(from: &FromSource, mapping: &QueryMapping, cache: &mut HashMap<usize, Rc<PlanNode>>) -> Result<PlanNode, CompileError> {
    match from {
        FromSource::CollectionRef { collection, alias } => Ok(PlanNode::Scan {
            collection: collection.clone(),
            alias: alias.clone(),
        }),
        FromSource::QueryRef { query, alias } => {
            let original_ptr = mapping
                .get(&(Rc::as_ptr(query) as usize))
                .map(|orig| Rc::as_ptr(orig) as usize)
                .unwrap_or(Rc::as_ptr(query) as usize);
            let shape = compute_final_shape(query);
            if let Some(existing) = cache.get(&original_ptr) {
                return Ok(PlanNode::Cached {
                    cache_key: original_ptr,
                    node: existing.clone(),
                    shape,
                    alias: alias.clone(),
                });
            }
            let compiled = compile_query_body(query, mapping, cache)?;
            let rc = Rc::new(compiled);
            cache.insert(original_ptr, rc.clone());
            Ok(PlanNode::Cached { cache_key: original_ptr, node: rc, shape, alias: alias.clone() })
        }
    }
}

enum JoinSide {
    Main,
    Joined,
    Other,
}

fn classify_side(sources: &std::collections::BTreeSet<String>, joined_alias: &str, accumulated: &HashSet<String>) -> JoinSide {
    if sources.len() == 1 {
        let a = sources.iter().next().unwrap();
        if a == joined_alias {
            JoinSide::Joined
        } else if accumulated.contains(a) {
            JoinSide::Main
        } else {
            JoinSide::Other
        }
    } else {
        JoinSide::Other
    }
}

/// Determines the main/joined sides of a join condition and validates it
/// (spec.md §4.5 step 4): each side must reference exactly one alias,
/// one the newly joined alias and the other an alias already in scope.
fn compile_join(
    accumulated: PlanNode,
    accumulated_aliases: &mut HashSet<String>,
    clause: &JoinClause,
    mapping: &QueryMapping,
    cache: &mut HashMap<usize, Rc<PlanNode>>,
) -> Result<PlanNode, CompileError> {
    let joined_alias = clause.from.alias().to_string();
    let left_side = classify_side(&clause.left.sources(), &joined_alias, accumulated_aliases);
    let right_side = classify_side(&clause.right.sources(), &joined_alias, accumulated_aliases);

    let (main_expr, joined_expr) = match (left_side, right_side) {
        (JoinSide::Main, JoinSide::Joined) => (&clause.left, &clause.right),
        (JoinSide::Joined, JoinSide::Main) => (&clause.right, &clause.left),
        (JoinSide::Joined, JoinSide::Joined) => return Err(CompileError::InvalidJoinConditionSameTable(joined_alias)),
        (JoinSide::Main, JoinSide::Main) => return Err(CompileError::InvalidJoinConditionWrongTables(joined_alias)),
        _ => return Err(CompileError::InvalidJoinConditionTableMismatch(joined_alias)),
    };

    let main_key = expr::compile_namespaced(main_expr)?;
    let joined_key = expr::compile_namespaced(joined_expr)?;
    let joined_plan = compile_from(&clause.from, mapping, cache)?;
    accumulated_aliases.insert(joined_alias);

    Ok(PlanNode::Join {
        main: Box::new(accumulated),
        joined: Box::new(joined_plan),
        op: RefCell::new(JoinOperator::new(clause.join_type.normalize())),
        main_key,
        joined_key,
    })
}

/// Compiles the body of a `Query`: FROM, JOINs, WHERE, GROUP BY/HAVING or
/// early SELECT, ORDER BY/LIMIT/OFFSET, fnSelect - everything but the
/// wrapping needed to present it as a cached subquery.
fn compile_query_body(query: &Query, mapping: &QueryMapping, cache: &mut HashMap<usize, Rc<PlanNode>>) -> Result<PlanNode, CompileError> {
    let from = query.from.as_ref().ok_or_else(|| CompileError::CollectionInputNotFound("<missing FROM>".to_string()))?;
    let mut plan = compile_from(from, mapping, cache)?;
    let mut aliases: HashSet<String> = std::iter::once(from.alias().to_string()).collect();

    for join in &query.join {
        plan = compile_join(plan, &mut aliases, join, mapping, cache)?;
    }

    if !query.filter.is_empty() {
        let preds = query.filter.iter().map(expr::compile_namespaced).collect::<Result<_, _>>()?;
        plan = PlanNode::Filter { input: Box::new(plan), preds };
    }
    if let Some(f) = &query.callbacks.fn_where {
        plan = PlanNode::FnWhere { input: Box::new(plan), f: f.clone() };
    }

    let group_plan = if !query.group_by.is_empty() || query.has_aggregates() {
        Some(compile_group_by(plan, query)?)
    } else {
        None
    };

    let plan = if let Some(grouped) = group_plan {
        grouped
    } else if !query.select.is_empty() {
        let entries = query
            .select
            .iter()
            .map(|s| Ok((s.alias.clone(), expr::compile_namespaced(&s.expression)?)))
            .collect::<Result<_, CompileError>>()?;
        PlanNode::Project { input: Box::new(plan), entries }
    } else {
        plan
    };

    let plan = if !query.order_by.is_empty() {
        let comparators = query
            .order_by
            .iter()
            .map(|o| {
                Ok(CompiledOrder {
                    eval: expr::compile_namespaced(&o.expression)?,
                    direction: o.direction,
                    nulls: o.nulls,
                    string_sort: o.string_sort,
                })
            })
            .collect::<Result<_, CompileError>>()?;
        PlanNode::OrderBy {
            input: Box::new(plan),
            op: RefCell::new(TopKOperator::default()),
            comparators,
            limit: query.limit,
            offset: query.offset,
        }
    } else {
        plan
    };

    let plan = if let Some(f) = &query.callbacks.fn_select {
        PlanNode::FnSelect { input: Box::new(plan), f: f.clone() }
    } else {
        plan
    };

    Ok(plan)
}

fn compile_group_by(input: PlanNode, query: &Query) -> Result<PlanNode, CompileError> {
    let group_by: Vec<NamespacedEvaluator> = query.group_by.iter().map(expr::compile_namespaced).collect::<Result<_, _>>()?;

    let mut aggregates = Vec::new();
    let mut passthrough = Vec::new();
    for entry in &query.select {
        match &entry.expression {
            Expression::Aggregate { name, args } => {
                let arg = args.first().cloned().unwrap_or(Expression::val(Value::Null));
                aggregates.push(AggregateSpec {
                    alias: entry.alias.clone(),
                    func: *name,
                    arg: expr::compile_namespaced(&arg)?,
                });
            }
            other => {
                let idx = query
                    .group_by
                    .iter()
                    .position(|g| g == other)
                    .ok_or_else(|| CompileError::NonAggregateExpressionNotInGroupBy(entry.alias.clone()))?;
                passthrough.push((entry.alias.clone(), idx));
            }
        }
    }

    let grouped = PlanNode::GroupBy {
        input: Box::new(input),
        op: RefCell::new(GroupByOperator::default()),
        group_by,
        aggregates,
        passthrough,
    };

    if query.having.is_empty() && query.callbacks.fn_having.is_none() {
        return Ok(grouped);
    }

    let plan = if query.having.is_empty() {
        grouped
    } else {
        let preds = query
            .having
            .iter()
            .map(|h| rewrite_having(h, &query.select).and_then(|r| expr::compile_namespaced(&r)))
            .collect::<Result<_, CompileError>>()?;
        PlanNode::Having { input: Box::new(grouped), preds }
    };

    let plan = if let Some(f) = &query.callbacks.fn_having {
        let f = f.clone();
        PlanNode::Having {
            input: Box::new(plan),
            preds: vec![Rc::new(move |row: &Row| {
                let result = row.get("result").cloned().unwrap_or_default();
                Value::Bool(f(&result))
            })],
        }
    } else {
        plan
    };

    Ok(plan)
}

/// Rewrites a HAVING expression so aggregates matching a SELECT entry, or
/// direct references to a SELECT alias, become `result.<alias>` lookups
/// (spec.md §4.5 step 5). Aggregates with no SELECT counterpart fail.
fn rewrite_having(expr: &Expression, select: &[SelectEntry]) -> Result<Expression, CompileError> {
    match expr {
        Expression::Aggregate { .. } => select
            .iter()
            .find(|s| &s.expression == expr)
            .map(|s| Expression::ResultRef(s.alias.clone()))
            .ok_or_else(|| CompileError::AggregateFunctionNotInSelect(format!("{expr:?}"))),
        Expression::PropRef(path) if path.len() == 1 => {
            if let Some(s) = select.iter().find(|s| s.alias == path[0]) {
                Ok(Expression::ResultRef(s.alias.clone()))
            } else {
                Ok(expr.clone())
            }
        }
        Expression::Func { name, args } => Ok(Expression::Func {
            name: *name,
            args: args.iter().map(|a| rewrite_having(a, select)).collect::<Result<_, _>>()?,
        }),
        Expression::Val(_) | Expression::PropRef(_) | Expression::ResultRef(_) => Ok(expr.clone()),
    }
}

/// Compiles a top-level optimized query into a runnable pipeline.
pub fn compile(query: &Query, mapping: &QueryMapping) -> Result<CompiledQuery, CompileError> {
    query.validate_shape()?;
    let mut cache = HashMap::new();
    let root = compile_query_body(query, mapping, &mut cache)?;
    let final_shape = compute_final_shape(query);
    Ok(CompiledQuery { root, final_shape })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AggregateFunc, FuncName, JoinType, OrderByEntry, SelectEntry};
    use crate::optimizer::Optimizer;
    use crate::value::Key;
    use std::collections::HashMap;

    fn make_record(fields: &[(&str, Value)]) -> Record {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn tuple(key: Key, record: Record, mult: i64) -> (String, Record, i64) {
        (key.to_string(), record, mult)
    }

    #[test]
    fn filter_equality_scenario() {
        let mut q = Query::new(FromSource::CollectionRef { collection: "users".into(), alias: "u".into() });
        q.filter.push(Expression::func(
            FuncName::Eq,
            vec![Expression::prop_ref(vec!["u".into(), "active".into()]).unwrap(), Expression::val(true)],
        ));
        let (optimized, mapping) = Optimizer::default().optimize(q);
        let compiled = compile(&optimized, &mapping).unwrap();

        let mut deltas = HashMap::new();
        deltas.insert(
            "users".to_string(),
            vec![
                tuple(Key::Int(1), make_record(&[("id", Value::Int(1)), ("active", Value::Bool(true))]), 1),
                tuple(Key::Int(2), make_record(&[("id", Value::Int(2)), ("active", Value::Bool(false))]), 1),
                tuple(Key::Int(3), make_record(&[("id", Value::Int(3)), ("active", Value::Bool(true))]), 1),
            ],
        );
        let out = compiled.run(&deltas);
        let keys: std::collections::BTreeSet<String> = out.iter().map(|(k, _, _)| k.clone()).collect();
        assert_eq!(keys, ["1".to_string(), "3".to_string()].into_iter().collect());
    }

    #[test]
    fn group_by_having_scenario() {
        let mut q = Query::new(FromSource::CollectionRef { collection: "orders".into(), alias: "o".into() });
        q.group_by.push(Expression::prop_ref(vec!["o".into(), "cust".into()]).unwrap());
        q.select.push(SelectEntry { alias: "cust".into(), expression: Expression::prop_ref(vec!["o".into(), "cust".into()]).unwrap() });
        q.select.push(SelectEntry {
            alias: "total".into(),
            expression: Expression::aggregate(AggregateFunc::Sum, vec![Expression::prop_ref(vec!["o".into(), "amt".into()]).unwrap()]),
        });
        q.having.push(Expression::func(
            FuncName::Gt,
            vec![
                Expression::aggregate(AggregateFunc::Sum, vec![Expression::prop_ref(vec!["o".into(), "amt".into()]).unwrap()]),
                Expression::val(150_i64),
            ],
        ));
        let (optimized, mapping) = Optimizer::default().optimize(q);
        let compiled = compile(&optimized, &mapping).unwrap();

        let mut deltas = HashMap::new();
        deltas.insert(
            "orders".to_string(),
            vec![
                tuple(Key::Int(1), make_record(&[("cust", Value::Int(1)), ("amt", Value::Int(100))]), 1),
                tuple(Key::Int(2), make_record(&[("cust", Value::Int(1)), ("amt", Value::Int(200))]), 1),
                tuple(Key::Int(3), make_record(&[("cust", Value::Int(2)), ("amt", Value::Int(50))]), 1),
            ],
        );
        let out = compiled.run(&deltas);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.get("total"), Some(&Value::Float(300.0)));
    }

    #[test]
    fn order_by_limit_scenario() {
        let mut q = Query::new(FromSource::CollectionRef { collection: "users".into(), alias: "u".into() });
        let mut entry = OrderByEntry::new(Expression::prop_ref(vec!["u".into(), "age".into()]).unwrap());
        entry.direction = SortDirection::Desc;
        q.order_by.push(entry);
        q.limit = Some(2);
        let (optimized, mapping) = Optimizer::default().optimize(q);
        let compiled = compile(&optimized, &mapping).unwrap();

        let mut deltas = HashMap::new();
        deltas.insert(
            "users".to_string(),
            vec![
                tuple(Key::Int(1), make_record(&[("name", Value::String("Alice".into())), ("age", Value::Int(25))]), 1),
                tuple(Key::Int(2), make_record(&[("name", Value::String("Bob".into())), ("age", Value::Int(19))]), 1),
                tuple(Key::Int(3), make_record(&[("name", Value::String("Charlie".into())), ("age", Value::Int(30))]), 1),
                tuple(Key::Int(4), make_record(&[("name", Value::String("Dave".into())), ("age", Value::Int(22))]), 1),
            ],
        );
        let out = compiled.run(&deltas);
        let names: Vec<String> = out.iter().map(|(_, r, _)| r.get("name").unwrap().coerce_to_string()).collect();
        assert_eq!(names, vec!["Charlie".to_string(), "Alice".to_string()]);
    }

    #[test]
    fn inner_join_scenario() {
        let mut q = Query::new(FromSource::CollectionRef { collection: "users".into(), alias: "u".into() });
        q.join.push(JoinClause {
            from: FromSource::CollectionRef { collection: "posts".into(), alias: "p".into() },
            join_type: JoinType::Inner,
            left: Expression::prop_ref(vec!["u".into(), "id".into()]).unwrap(),
            right: Expression::prop_ref(vec!["p".into(), "userId".into()]).unwrap(),
        });
        q.select.push(SelectEntry { alias: "name".into(), expression: Expression::prop_ref(vec!["u".into(), "name".into()]).unwrap() });
        q.select.push(SelectEntry { alias: "postId".into(), expression: Expression::prop_ref(vec!["p".into(), "id".into()]).unwrap() });
        let (optimized, mapping) = Optimizer::default().optimize(q);
        let compiled = compile(&optimized, &mapping).unwrap();

        let mut deltas = HashMap::new();
        deltas.insert(
            "users".to_string(),
            vec![
                tuple(Key::Int(1), make_record(&[("id", Value::Int(1)), ("name", Value::String("Alice".into()))]), 1),
                tuple(Key::Int(2), make_record(&[("id", Value::Int(2)), ("name", Value::String("Bob".into()))]), 1),
            ],
        );
        deltas.insert(
            "posts".to_string(),
            vec![
                tuple(Key::Int(10), make_record(&[("id", Value::Int(10)), ("userId", Value::Int(1))]), 1),
                tuple(Key::Int(11), make_record(&[("id", Value::Int(11)), ("userId", Value::Int(3))]), 1),
            ],
        );
        let out = compiled.run(&deltas);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "[1,10]");
        assert_eq!(out[0].1.get("name"), Some(&Value::String("Alice".into())));
    }

    #[test]
    fn shared_subquery_is_computed_once_per_run() {
        let shared = Rc::new({
            let mut inner = Query::new(FromSource::CollectionRef { collection: "users".into(), alias: "u".into() });
            inner.select.push(SelectEntry { alias: "id".into(), expression: Expression::prop_ref(vec!["u".into(), "id".into()]).unwrap() });
            inner
        });
        let mut q = Query::new(FromSource::QueryRef { query: shared.clone(), alias: "a".into() });
        q.join.push(JoinClause {
            from: FromSource::QueryRef { query: shared, alias: "b".into() },
            join_type: JoinType::Inner,
            left: Expression::prop_ref(vec!["a".into(), "id".into()]).unwrap(),
            right: Expression::prop_ref(vec!["b".into(), "id".into()]).unwrap(),
        });
        let (optimized, mapping) = Optimizer::default().optimize(q);
        let compiled = compile(&optimized, &mapping).unwrap();

        let mut deltas = HashMap::new();
        deltas.insert("users".to_string(), vec![tuple(Key::Int(1), make_record(&[("id", Value::Int(1))]), 1)]);
        let out = compiled.run(&deltas);
        assert_eq!(out.len(), 1);
    }
}
