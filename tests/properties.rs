//! Property tests for the universal invariants in spec.md §8: incremental
//! equivalence and key stability, exercised over randomized sequences of
//! source changes against a single filter query.

mod support;

use flowquery::driver::{ChangeMessage, LiveQueryCollection, SourceCollection};
use flowquery::ir::builders::{col, val, QueryBuilder};
use flowquery::ir::{Expression, FuncName};
use flowquery::value::Value;
use flowquery::QueryEngine;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use support::{rec, VecSource};

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, bool),
    Delete(i64),
    Update(i64, bool),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..20, any::<bool>()).prop_map(|(id, active)| Op::Insert(id, active)),
        (0i64..20).prop_map(Op::Delete),
        (0i64..20, any::<bool>()).prop_map(|(id, active)| Op::Update(id, active)),
    ]
}

fn active_users_query() -> flowquery::ir::Query {
    let u = col("u");
    QueryBuilder::from_collection("users", "u")
        .filter(Expression::func(FuncName::Eq, vec![u.field("active"), val(true)]))
        .build()
        .unwrap()
}

fn user_rec(id: i64, active: bool) -> flowquery::value::Record {
    rec(&[("id", Value::Int(id)), ("active", Value::Bool(active))])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn incremental_equivalence_matches_fresh_build(ops in proptest::collection::vec(op_strategy(), 0..30)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            // Model the expected final state by replaying `ops` over a plain map.
            let mut model: HashMap<i64, bool> = HashMap::new();
            let initial = VecSource::new("id", vec![]);
            let query = active_users_query();
            let engine = QueryEngine::default();
            let mut sources: HashMap<String, Rc<dyn SourceCollection>> = HashMap::new();
            sources.insert("users".to_string(), initial.clone());
            let live = engine.live_query(None, query, sources).unwrap();
            LiveQueryCollection::preload(&live).await;

            for op in &ops {
                match op {
                    Op::Insert(id, active) => {
                        if !model.contains_key(id) {
                            model.insert(*id, *active);
                            initial.push(ChangeMessage::Insert(user_rec(*id, *active)));
                        }
                    }
                    Op::Delete(id) => {
                        if let Some(active) = model.remove(id) {
                            initial.push(ChangeMessage::Delete(user_rec(*id, active)));
                        }
                    }
                    Op::Update(id, active) => {
                        if let Some(old_active) = model.get(id).copied() {
                            model.insert(*id, *active);
                            initial.push(ChangeMessage::Update(
                                user_rec(*id, old_active),
                                user_rec(*id, *active),
                            ));
                        }
                    }
                }
            }

            let incremental_keys: HashSet<String> = live.entries().into_iter().map(|(k, _)| k).collect();

            // Fresh build: a new driver seeded directly from the model's final state.
            let final_records: Vec<_> = model
                .iter()
                .map(|(id, active)| user_rec(*id, *active))
                .collect();
            let fresh_source = VecSource::new("id", final_records);
            let fresh_query = active_users_query();
            let fresh_engine = QueryEngine::default();
            let mut fresh_sources: HashMap<String, Rc<dyn SourceCollection>> = HashMap::new();
            fresh_sources.insert("users".to_string(), fresh_source);
            let fresh_live = fresh_engine.live_query(None, fresh_query, fresh_sources).unwrap();
            LiveQueryCollection::preload(&fresh_live).await;

            let fresh_keys: HashSet<String> = fresh_live.entries().into_iter().map(|(k, _)| k).collect();

            prop_assert_eq!(incremental_keys, fresh_keys);
            Ok(())
        })?;
    }

    #[test]
    fn key_stability_across_updates(id in 0i64..20, a in any::<bool>(), b in any::<bool>()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let source = VecSource::new("id", vec![user_rec(id, a)]);
            let query = active_users_query();
            let engine = QueryEngine::default();
            let mut sources: HashMap<String, Rc<dyn SourceCollection>> = HashMap::new();
            sources.insert("users".to_string(), source.clone());
            let live = engine.live_query(None, query, sources).unwrap();
            LiveQueryCollection::preload(&live).await;

            let key_before = live.entries().into_iter().map(|(k, _)| k).next();

            source.push(ChangeMessage::Update(user_rec(id, a), user_rec(id, b)));

            let key_after = live.entries().into_iter().map(|(k, _)| k).next();

            // The key for this id, if present on both sides of the update, must
            // be identical (spec.md §8 "Key stability").
            if let (Some(before), Some(after)) = (&key_before, &key_after) {
                prop_assert_eq!(before, after);
            }
            Ok(())
        })?;
    }
}
