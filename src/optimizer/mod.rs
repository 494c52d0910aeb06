//! # Optimizer
//!
//! Predicate pushdown and subquery flattening on `Query` IR (spec.md
//! §4.4), applied to a fixed point bounded by `max_iterations` - the same
//! fixpoint-loop shape as a classical rewrite-rule optimizer, just with
//! this engine's own rule set (conjunction split, source classification,
//! single-source pushdown, subquery safety gates, redundant-subquery
//! elimination, copy-on-write subquery identity).

use crate::ir::{Expression, FromSource, FuncName, JoinClause, Query};
use std::collections::HashMap;
use std::rc::Rc;

/// Maps a rewritten subquery's `Rc` identity back to the original
/// subquery it was derived from (spec.md §4.4: "the optimizer returns
/// both the rewritten query and a query mapping"). The compiler's
/// sub-pipeline cache (spec.md §4.5) is keyed by this original identity so
/// that subqueries left untouched by optimization still share one
/// computation wherever they recur.
pub type QueryMapping = HashMap<usize, Rc<Query>>;

pub struct Optimizer {
    pub max_iterations: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer { max_iterations: 16 }
    }
}

impl Optimizer {
    pub fn new(max_iterations: usize) -> Self {
        Optimizer { max_iterations }
    }

    pub fn optimize(&self, query: Query) -> (Query, QueryMapping) {
        let mut mapping = QueryMapping::new();
        let mut current = query;
        for _ in 0..self.max_iterations {
            let next = optimize_once(&current, &mut mapping);
            if next == current {
                return (next, mapping);
            }
            current = next;
        }
        (current, mapping)
    }
}

fn ptr_key(rc: &Rc<Query>) -> usize {
    Rc::as_ptr(rc) as usize
}

fn record_mapping(mapping: &mut QueryMapping, new_rc: &Rc<Query>, old_rc: &Rc<Query>) {
    let root = mapping.get(&ptr_key(old_rc)).cloned().unwrap_or_else(|| old_rc.clone());
    mapping.insert(ptr_key(new_rc), root);
}

/// Rule 1: a top-level clause of the form `and(a, b, ...)` becomes the
/// list `[a, b, ...]`. OR is never split.
fn split_conjunctions(filter: Vec<Expression>) -> Vec<Expression> {
    let mut out = Vec::new();
    for e in filter {
        flatten_and(e, &mut out);
    }
    out
}

fn flatten_and(e: Expression, out: &mut Vec<Expression>) {
    match e {
        Expression::Func { name: FuncName::And, args } => {
            for a in args {
                flatten_and(a, out);
            }
        }
        other => out.push(other),
    }
}

/// Rule 6: pushdown into a subquery is disallowed when it has aggregates,
/// a HAVING clause, LIMIT/OFFSET, or any functional callback. `orderBy`
/// alone is safe.
fn subquery_accepts_pushdown(q: &Query) -> bool {
    !q.has_aggregates()
        && q.having.is_empty()
        && q.limit.is_none()
        && q.offset.is_none()
        && q.callbacks.fn_where.is_none()
        && q.callbacks.fn_having.is_none()
        && q.callbacks.fn_select.is_none()
}

/// Rule 7: a `QueryRef` whose inner query has only a `from` (nothing
/// else attached) is redundant; replace it with its inner `from` directly
/// (re-aliased to the outer position's alias).
fn simplify_from(from: FromSource) -> FromSource {
    match from {
        FromSource::QueryRef { query, alias } => {
            let is_bare = query.join.is_empty()
                && query.filter.is_empty()
                && query.select.is_empty()
                && query.group_by.is_empty()
                && query.having.is_empty()
                && query.order_by.is_empty()
                && query.limit.is_none()
                && query.offset.is_none()
                && query.callbacks == Default::default();
            if is_bare {
                if let Some(inner_from) = &query.from {
                    return simplify_from(realias(inner_from.clone(), alias));
                }
            }
            FromSource::QueryRef { query, alias }
        }
        other => other,
    }
}

fn realias(from: FromSource, alias: String) -> FromSource {
    match from {
        FromSource::CollectionRef { collection, .. } => FromSource::CollectionRef { collection, alias },
        FromSource::QueryRef { query, .. } => FromSource::QueryRef { query, alias },
    }
}

/// Pushes `clause` into `from`, wrapping a bare `CollectionRef` in a fresh
/// `QueryRef`, or copy-on-write cloning an existing `QueryRef`'s inner
/// query before appending. Returns `None` if the target is a `QueryRef`
/// that fails the safety gate.
fn push_into(from: &FromSource, clause: Expression, mapping: &mut QueryMapping) -> Option<FromSource> {
    match from {
        FromSource::CollectionRef { collection, alias } => {
            let mut inner = Query::new(FromSource::CollectionRef {
                collection: collection.clone(),
                alias: alias.clone(),
            });
            inner.filter.push(clause);
            Some(FromSource::QueryRef {
                query: Rc::new(inner),
                alias: alias.clone(),
            })
        }
        FromSource::QueryRef { query, alias } => {
            if !subquery_accepts_pushdown(query) {
                return None;
            }
            let mut inner = (**query).clone();
            inner.filter.push(clause);
            let new_rc = Rc::new(inner);
            record_mapping(mapping, &new_rc, query);
            Some(FromSource::QueryRef {
                query: new_rc,
                alias: alias.clone(),
            })
        }
    }
}

/// Recursively optimizes `from` itself (bottom-up, satisfying rule 9's
/// "recursion to convergence" within a single pass) before the caller
/// considers pushing further clauses into it.
fn optimize_from(from: FromSource, mapping: &mut QueryMapping) -> FromSource {
    match from {
        FromSource::QueryRef { query, alias } => {
            let optimized = optimize_once(&query, mapping);
            if optimized == *query {
                simplify_from(FromSource::QueryRef { query, alias })
            } else {
                let new_rc = Rc::new(optimized);
                record_mapping(mapping, &new_rc, &query);
                simplify_from(FromSource::QueryRef { query: new_rc, alias })
            }
        }
        other => other,
    }
}

fn optimize_once(query: &Query, mapping: &mut QueryMapping) -> Query {
    let mut out = query.clone();

    if let Some(from) = out.from.take() {
        out.from = Some(optimize_from(from, mapping));
    }
    out.join = out
        .join
        .into_iter()
        .map(|j| JoinClause {
            from: optimize_from(j.from, mapping),
            ..j
        })
        .collect();

    let has_join = !out.join.is_empty();
    let clauses = split_conjunctions(std::mem::take(&mut out.filter));
    let mut remaining = Vec::new();

    for clause in clauses {
        let sources = clause.sources();
        if sources.is_empty() {
            // Rule 5: zero-source clauses are discarded (constants or
            // empty-alias PropRefs contribute nothing to filtering).
            continue;
        }
        if sources.len() == 1 && has_join {
            let alias = sources.iter().next().unwrap();
            if let Some(new_from) = target_from_mut(&mut out, alias) {
                if let Some(pushed) = push_into(new_from, clause.clone(), mapping) {
                    *new_from = pushed;
                    continue;
                }
            }
        }
        remaining.push(clause);
    }

    out.filter = remaining;
    out
}

fn target_from_mut<'a>(query: &'a mut Query, alias: &str) -> Option<&'a mut FromSource> {
    if let Some(from) = &query.from {
        if from.alias() == alias {
            return query.from.as_mut();
        }
    }
    query.join.iter_mut().find(|j| j.from.alias() == alias).map(|j| &mut j.from)
}
