//! # Dataflow runtime
//!
//! A differential-dataflow mini-engine (spec.md §4.1): streams of signed
//! multiset tuples flow through map/filter/consolidate/join/groupBy/topK
//! operators. Scheduling is single-threaded and cooperative - there is one
//! logical worker, operators never block, and a full run drains every
//! pending batch before returning (spec.md §5).
//!
//! A "row" is kept namespaced (`alias -> record`) all the way through the
//! pipeline, even after a single-source stage would conceptually unwrap to
//! a bare record (spec.md §3) - evaluators that expect a single-row shape
//! simply read the one entry present. This keeps one tuple shape for every
//! operator instead of parameterizing the whole module over two row
//! representations.

use crate::ir::RuntimeJoinType;
use crate::value::{Record, Value};
use std::collections::{HashMap, HashSet};

pub type Row = HashMap<String, Record>;
/// `(key, row, multiplicity)` - spec.md §3's signed multiset tuple
/// `((K, V), m)`, flattened into a 3-tuple.
pub type Tuple = (String, Row, i64);
pub type Batch = Vec<Tuple>;
/// A raw collection's delta batch, keyed by collection id rather than by
/// query alias - the same collection can be scanned under different
/// aliases (e.g. a self-join), so namespacing happens at the `Scan` plan
/// node, not at the source (spec.md §4.6).
pub type SourceBatch = Vec<(String, Record, i64)>;

/// Deterministic string key for grouping tuples by row *content*, used by
/// `consolidate` (spec.md §4.1: "sums multiplicities per `(K,V)`"). Debug
/// formatting is type-preserving (distinguishes `Int(1)` from
/// `String("1")`), unlike a plain stringification.
pub fn canonical_row(row: &Row) -> String {
    let mut aliases: Vec<&String> = row.keys().collect();
    aliases.sort();
    let mut s = String::new();
    for alias in aliases {
        s.push_str(alias);
        s.push('=');
        let record = &row[alias];
        let mut fields: Vec<&String> = record.keys().collect();
        fields.sort();
        for field in fields {
            s.push_str(field);
            s.push(':');
            s.push_str(&format!("{:?}", record[field]));
            s.push(';');
        }
        s.push('|');
    }
    s
}

pub fn map(batch: Batch, f: impl Fn(&str, &Row) -> (String, Row)) -> Batch {
    batch
        .into_iter()
        .map(|(k, row, m)| {
            let (nk, nr) = f(&k, &row);
            (nk, nr, m)
        })
        .collect()
}

pub fn filter(batch: Batch, p: impl Fn(&str, &Row) -> bool) -> Batch {
    batch.into_iter().filter(|(k, row, _)| p(k, row)).collect()
}

/// Sums multiplicities per `(key, row content)` and drops zero results
/// (spec.md §4.1). Required before joins and after any operator that can
/// produce cancelling pairs within the same batch.
pub fn consolidate(batch: Batch) -> Batch {
    let mut acc: HashMap<(String, String), (Row, i64)> = HashMap::new();
    for (key, row, mult) in batch {
        let rk = canonical_row(&row);
        let entry = acc.entry((key, rk)).or_insert_with(|| (row.clone(), 0));
        entry.1 += mult;
    }
    acc.into_iter()
        .filter(|(_, (_, m))| *m != 0)
        .map(|((k, _), (row, m))| (k, row, m))
        .collect()
}

fn composite_key(main: &str, joined: &str) -> String {
    format!("[{main},{joined}]")
}

fn merge_rows(left: &Row, right: &Row) -> Row {
    let mut out = left.clone();
    for (alias, record) in right {
        out.insert(alias.clone(), record.clone());
    }
    out
}

/// Hash-indexed equi-join (spec.md §4.1). Maintains one index per side,
/// keyed by the caller-supplied join key; per-side state is bucketed by
/// the upstream row's own identity key, which is a sound multiset
/// representation because source-collection keys are unique within their
/// collection (spec.md §3).
pub struct JoinOperator {
    join_type: RuntimeJoinType,
    left_index: HashMap<String, HashMap<String, (Row, i64)>>,
    right_index: HashMap<String, HashMap<String, (Row, i64)>>,
    /// Orig key -> the exact padded tuple last emitted for it, so the
    /// padding can be retracted with an identical `(key, row)` pair once a
    /// match appears (spec.md §4.1: "joinType governs null-padding...
    /// after all batches... are processed").
    left_padded: HashMap<String, (String, Row)>,
    right_padded: HashMap<String, (String, Row)>,
}

impl JoinOperator {
    pub fn new(join_type: RuntimeJoinType) -> Self {
        JoinOperator {
            join_type,
            left_index: HashMap::new(),
            right_index: HashMap::new(),
            left_padded: HashMap::new(),
            right_padded: HashMap::new(),
        }
    }

    pub fn push_left(&mut self, batch: Batch, key_fn: &dyn Fn(&Row) -> String) -> Batch {
        self.push(batch, key_fn, Side::Left)
    }

    pub fn push_right(&mut self, batch: Batch, key_fn: &dyn Fn(&Row) -> String) -> Batch {
        self.push(batch, key_fn, Side::Right)
    }

    fn push(&mut self, batch: Batch, key_fn: &dyn Fn(&Row) -> String, side: Side) -> Batch {
        let mut out = Batch::new();
        let mut touched: Vec<(String, String)> = Vec::new();

        for (orig_key, row, mult) in batch {
            let jk = key_fn(&row);
            let other_index = match side {
                Side::Left => &self.right_index,
                Side::Right => &self.left_index,
            };
            if let Some(bucket) = other_index.get(&jk) {
                for (other_key, (other_row, other_mult)) in bucket {
                    if *other_mult == 0 {
                        continue;
                    }
                    let (merged, out_key) = match side {
                        Side::Left => (merge_rows(&row, other_row), composite_key(&orig_key, other_key)),
                        Side::Right => (merge_rows(other_row, &row), composite_key(other_key, &orig_key)),
                    };
                    out.push((out_key, merged, mult * other_mult));
                }
            }

            let own_index = match side {
                Side::Left => &mut self.left_index,
                Side::Right => &mut self.right_index,
            };
            let bucket = own_index.entry(jk.clone()).or_default();
            let entry = bucket.entry(orig_key.clone()).or_insert((row.clone(), 0));
            entry.1 += mult;
            entry.0 = row;
            if entry.1 == 0 {
                bucket.remove(&orig_key);
            }
            touched.push((orig_key, jk));
        }

        out.extend(self.reconcile_padding(side, &touched));
        out
    }

    fn reconcile_padding(&mut self, side: Side, touched: &[(String, String)]) -> Batch {
        let pads_this_side = match (side, self.join_type) {
            (Side::Left, RuntimeJoinType::Left | RuntimeJoinType::Full) => true,
            (Side::Right, RuntimeJoinType::Right | RuntimeJoinType::Full) => true,
            _ => false,
        };
        if !pads_this_side {
            return Batch::new();
        }

        let mut out = Batch::new();
        for (orig_key, jk) in touched {
            let (own_index, other_index, padded) = match side {
                Side::Left => (&self.left_index, &self.right_index, &mut self.left_padded),
                Side::Right => (&self.right_index, &self.left_index, &mut self.right_padded),
            };
            let present = own_index.get(jk).and_then(|b| b.get(orig_key));
            let has_match = other_index.get(jk).map(|b| b.values().any(|(_, m)| *m != 0)).unwrap_or(false);

            match (present, has_match, padded.contains_key(orig_key)) {
                (Some((row, _)), false, false) => {
                    let pad_key = match side {
                        Side::Left => composite_key(orig_key, ""),
                        Side::Right => composite_key("", orig_key),
                    };
                    padded.insert(orig_key.clone(), (pad_key.clone(), row.clone()));
                    out.push((pad_key, row.clone(), 1));
                }
                (None, _, true) | (Some(_), true, true) => {
                    if let Some((pad_key, pad_row)) = padded.remove(orig_key) {
                        out.push((pad_key, pad_row, -1));
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

/// Incremental `groupBy` / `reduce` (spec.md §4.1, §4.5 step 5). The group
/// key is the canonical string of the computed key values; `result`
/// carries both the finished aggregates and the passthrough GROUP BY
/// columns under the reserved `"result"` alias.
pub struct GroupByOperator {
    states: HashMap<String, HashMap<String, crate::expr::AggregateState>>,
    key_values: HashMap<String, Vec<Value>>,
    row_count: HashMap<String, i64>,
    last_output: HashMap<String, Row>,
}

impl Default for GroupByOperator {
    fn default() -> Self {
        GroupByOperator {
            states: HashMap::new(),
            key_values: HashMap::new(),
            row_count: HashMap::new(),
            last_output: HashMap::new(),
        }
    }
}

pub struct AggregateSpec {
    pub alias: String,
    pub func: crate::ir::AggregateFunc,
    pub arg: crate::expr::NamespacedEvaluator,
}

impl GroupByOperator {
    pub fn push(
        &mut self,
        batch: Batch,
        group_by: &[crate::expr::NamespacedEvaluator],
        aggregates: &[AggregateSpec],
    ) -> Batch {
        let mut touched: HashSet<String> = HashSet::new();
        for (_orig_key, row, mult) in &batch {
            let values: Vec<Value> = group_by.iter().map(|f| f(row)).collect();
            let gk = canonical_values(&values);
            self.key_values.entry(gk.clone()).or_insert(values);
            let state = self.states.entry(gk.clone()).or_default();
            for spec in aggregates {
                let v = (spec.arg)(row);
                state.entry(spec.alias.clone()).or_default().add(&v, *mult);
            }
            *self.row_count.entry(gk.clone()).or_insert(0) += mult;
            touched.insert(gk);
        }

        let mut out = Batch::new();
        for gk in touched {
            if let Some(prev) = self.last_output.remove(&gk) {
                out.push((gk.clone(), prev, -1));
            }
            let count = *self.row_count.get(&gk).unwrap_or(&0);
            if count > 0 {
                let mut result = Record::new();
                for spec in aggregates {
                    let finished = self.states[&gk][&spec.alias].finish(spec.func);
                    result.insert(spec.alias.clone(), finished);
                }
                let mut row = Row::new();
                row.insert("result".to_string(), result);
                row.insert(
                    "__group_key".to_string(),
                    keyed_values(&self.key_values[&gk]),
                );
                self.last_output.insert(gk.clone(), row.clone());
                out.push((gk, row, 1));
            } else {
                self.states.remove(&gk);
                self.key_values.remove(&gk);
                self.row_count.remove(&gk);
            }
        }
        out
    }
}

fn canonical_values(values: &[Value]) -> String {
    values.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>().join("\u{1}")
}

fn keyed_values(values: &[Value]) -> Record {
    let mut r = Record::new();
    for (i, v) in values.iter().enumerate() {
        r.insert(format!("__key_{i}"), v.clone());
    }
    r
}

/// `topK`/`orderBy` (spec.md §4.1). Maintains the full ordered set of live
/// rows and re-derives the windowed output on every batch; simple rather
/// than incrementally-minimal, but correct and bounded by the live result
/// set size, which is what `ORDER BY` queries are expected to materialize
/// in full regardless.
pub struct TopKOperator {
    rows: HashMap<String, Row>,
    insertion_order: HashMap<String, u64>,
    next_seq: u64,
}

impl Default for TopKOperator {
    fn default() -> Self {
        TopKOperator {
            rows: HashMap::new(),
            insertion_order: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl TopKOperator {
    /// Applies a batch of inserts/retracts (by key) and returns the
    /// current full live set in sorted order, each with a computed
    /// `__order_index` (spec.md §4.1's `ORDER_INDEX`). The caller applies
    /// limit/offset windowing.
    pub fn apply(
        &mut self,
        batch: Batch,
        cmp: &dyn Fn(&Row, &Row) -> std::cmp::Ordering,
    ) -> Vec<(String, Row)> {
        for (key, row, mult) in batch {
            if mult > 0 {
                self.rows.insert(key.clone(), row);
                self.insertion_order.entry(key).or_insert_with(|| {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    seq
                });
            } else if mult < 0 {
                self.rows.remove(&key);
                self.insertion_order.remove(&key);
            }
        }
        let mut ordered: Vec<(String, Row)> = self.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let insertion_order = &self.insertion_order;
        ordered.sort_by(|(ka, ra), (kb, rb)| cmp(ra, rb).then_with(|| insertion_order[ka].cmp(&insertion_order[kb])));
        ordered
    }
}
