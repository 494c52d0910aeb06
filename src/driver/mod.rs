//! # Live-collection driver
//!
//! Bridges upstream source collections to a compiled query's dataflow input
//! (spec.md §4.6): extracts every `CollectionRef` leaf the query reaches
//! (including inside joins and subqueries), seeds each referenced source's
//! current state as `+1` tuples, subscribes for future change messages, and
//! feeds every batch through `CompiledQuery::run`. Output tuples are
//! aggregated per key into a `{inserts, deletes, value}` counter and turned
//! back into insert/update/delete `ChangeMessage`s (spec.md §4.6). Also owns
//! the `idle -> loading -> ready -> closed` status state machine (§4.7).
//!
//! Single-threaded, cooperative (spec.md §5): one logical worker per graph,
//! no suspension except at batch boundaries, so state here is `Rc`/`RefCell`
//! rather than `Arc`/`Mutex`.

use crate::compiler::{self, CompiledQuery};
use crate::config::EngineConfig;
use crate::dataflow::SourceBatch;
use crate::errors::CompileError;
use crate::ir::{FromSource, Query};
use crate::optimizer::Optimizer;
use crate::value::{Key, Record};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

/// One upstream change (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeMessage {
    Insert(Record),
    Update(Record, Record),
    Delete(Record),
}

/// Source-collection contract consumed by the driver (spec.md §6). Objects
/// implementing this live outside the core (storage, sync adapters); the
/// driver only ever reads through this narrow surface.
pub trait SourceCollection {
    fn get_key(&self, record: &Record) -> Key;
    fn snapshot(&self) -> Vec<Record>;
    fn subscribe(&self, listener: Rc<dyn Fn(&[ChangeMessage])>) -> Unsubscribe;

    /// Brackets a batch of changes so they are delivered atomically
    /// (spec.md §6: "Optional begin/commit bracketing"). No-op by default.
    fn begin(&self) {}
    fn commit(&self) {}
}

/// An unsubscribe handle returned by `SourceCollection::subscribe`.
pub struct Unsubscribe(Box<dyn FnOnce()>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Unsubscribe(Box::new(f))
    }

    pub fn call(self) {
        (self.0)();
    }
}

/// Live collection status state machine (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Loading,
    Ready,
    Closed,
}

/// Write-back acknowledgement returned by a mutation handler; opaque to the
/// core (spec.md §6: "a handler-specific acknowledgement").
pub type MutationAck = Box<dyn std::any::Any>;

/// A single mutation within a write-back transaction (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub key: String,
    pub original: Option<Record>,
    pub modified: Option<Record>,
}

/// A batch of mutations the embedding application applied directly to a
/// live collection (spec.md §6: "transaction object whose `mutations`
/// describe ..."). The core never constructs these from graph output; it
/// only invokes the handler when the application calls `mutate`.
pub struct MutationTransaction {
    pub mutations: Vec<Mutation>,
}

type InsertHandler = Rc<dyn Fn(&MutationTransaction) -> MutationAck>;
type UpdateHandler = Rc<dyn Fn(&MutationTransaction) -> MutationAck>;
type DeleteHandler = Rc<dyn Fn(&MutationTransaction) -> MutationAck>;

/// Recursively collects every `CollectionRef` a query reaches, including
/// through joins and nested `QueryRef` subqueries (spec.md §4.6: "Extract
/// all CollectionRef leaves from the IR (including inside JOINs and
/// subqueries)").
fn collect_collection_ids(query: &Query) -> HashSet<String> {
    let mut ids = HashSet::new();
    collect_from_query(query, &mut ids);
    ids
}

fn collect_from_query(query: &Query, ids: &mut HashSet<String>) {
    if let Some(from) = &query.from {
        collect_from_source(from, ids);
    }
    for join in &query.join {
        collect_from_source(&join.from, ids);
    }
}

fn collect_from_source(from: &FromSource, ids: &mut HashSet<String>) {
    match from {
        FromSource::CollectionRef { collection, .. } => {
            ids.insert(collection.clone());
        }
        FromSource::QueryRef { query, .. } => collect_from_query(query, ids),
    }
}

/// A live, incrementally-maintained query result (spec.md §4.6, §6).
pub struct LiveQueryCollection {
    id: String,
    compiled: CompiledQuery,
    sources: HashMap<String, Rc<dyn SourceCollection>>,
    status: RefCell<Status>,
    results: RefCell<HashMap<String, Record>>,
    unsubscribes: RefCell<Vec<Unsubscribe>>,
    ready_notify: Notify,
    on_insert: RefCell<Option<InsertHandler>>,
    on_update: RefCell<Option<UpdateHandler>>,
    on_delete: RefCell<Option<DeleteHandler>>,
}

impl LiveQueryCollection {
    /// Compiles `query` and wires it to `sources` (keyed by the collection
    /// ids the query's `CollectionRef`s name). Errors if the query
    /// references a collection id not present in `sources`.
    #[instrument(skip_all)]
    pub fn new(
        id: impl Into<String>,
        query: Query,
        sources: HashMap<String, Rc<dyn SourceCollection>>,
        config: &EngineConfig,
    ) -> Result<Rc<Self>, CompileError> {
        let id = id.into();
        debug!(id = %id, "compiling live query");
        for collection in collect_collection_ids(&query) {
            if !sources.contains_key(&collection) {
                return Err(CompileError::CollectionInputNotFound(collection));
            }
        }

        let optimizer = Optimizer::new(config.optimizer_max_iterations);
        let (optimized, mapping) = optimizer.optimize(query);
        let compiled = compiler::compile(&optimized, &mapping)?;

        Ok(Rc::new(LiveQueryCollection {
            id,
            compiled,
            sources,
            status: RefCell::new(Status::Idle),
            results: RefCell::new(HashMap::new()),
            unsubscribes: RefCell::new(Vec::new()),
            ready_notify: Notify::new(),
            on_insert: RefCell::new(None),
            on_update: RefCell::new(None),
            on_delete: RefCell::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn size(&self) -> usize {
        self.results.borrow().len()
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.results.borrow().get(key).cloned()
    }

    pub fn entries(&self) -> Vec<(String, Record)> {
        self.results.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn values(&self) -> Vec<Record> {
        self.results.borrow().values().cloned().collect()
    }

    pub fn to_array(&self) -> Vec<Record> {
        self.values()
    }

    pub fn set_on_insert(&self, f: impl Fn(&MutationTransaction) -> MutationAck + 'static) {
        *self.on_insert.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_update(&self, f: impl Fn(&MutationTransaction) -> MutationAck + 'static) {
        *self.on_update.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_delete(&self, f: impl Fn(&MutationTransaction) -> MutationAck + 'static) {
        *self.on_delete.borrow_mut() = Some(Rc::new(f));
    }

    /// Seeds every source's current state, subscribes to future changes,
    /// and transitions `idle -> loading -> ready` (spec.md §4.6, §4.7).
    /// Resolves even when every source's initial state is empty.
    ///
    /// Takes `this` as an explicit `Rc` (rather than a `self: &Rc<Self>`
    /// receiver, which isn't a stable receiver type) because subscribing to
    /// sources needs to hand each one an owned `Rc` clone for its change
    /// callback.
    #[instrument(skip(this_rc), fields(id = %this_rc.id))]
    pub async fn preload(this_rc: &Rc<LiveQueryCollection>) {
        let this = this_rc.as_ref();
        {
            let mut status = this.status.borrow_mut();
            if *status != Status::Idle {
                return;
            }
            *status = Status::Loading;
        }
        debug!("loading source snapshots");

        let mut deltas: HashMap<String, SourceBatch> = HashMap::new();
        for (collection, source) in &this.sources {
            let batch: SourceBatch = source
                .snapshot()
                .into_iter()
                .map(|record| {
                    let key = source.get_key(&record);
                    (key.to_string(), record, 1)
                })
                .collect();
            deltas.insert(collection.clone(), batch);
        }
        this.apply_deltas(deltas);
        Self::subscribe_to_sources(this_rc);

        *this.status.borrow_mut() = Status::Ready;
        this.ready_notify.notify_waiters();
        debug!("ready");
    }

    /// Resolves once the collection reaches `Ready` (or immediately if it
    /// already has). Does not re-trigger loading.
    pub async fn wait_ready(&self) {
        if self.status() == Status::Ready {
            return;
        }
        self.ready_notify.notified().await;
    }

    fn subscribe_to_sources(this_rc: &Rc<LiveQueryCollection>) {
        for (collection, source) in this_rc.sources.clone() {
            let this = Rc::clone(this_rc);
            let unsub = source.subscribe(Rc::new(move |messages: &[ChangeMessage]| {
                this.handle_source_messages(&collection, messages);
            }));
            this_rc.unsubscribes.borrow_mut().push(unsub);
        }
    }

    /// Converts a batch of source change messages into signed tuples and
    /// runs them through the compiled graph (spec.md §4.6: "Each change is
    /// converted to signed tuples ... pushed before calling `graph.run()`").
    fn handle_source_messages(&self, collection: &str, messages: &[ChangeMessage]) {
        let Some(source) = self.sources.get(collection) else {
            warn!(collection, "change message for unknown collection id");
            return;
        };
        let mut batch = Vec::new();
        for message in messages {
            match message {
                ChangeMessage::Insert(value) => {
                    batch.push((source.get_key(value).to_string(), value.clone(), 1));
                }
                ChangeMessage::Delete(value) => {
                    batch.push((source.get_key(value).to_string(), value.clone(), -1));
                }
                ChangeMessage::Update(previous, value) => {
                    batch.push((source.get_key(previous).to_string(), previous.clone(), -1));
                    batch.push((source.get_key(value).to_string(), value.clone(), 1));
                }
            }
        }
        let mut deltas = HashMap::new();
        deltas.insert(collection.to_string(), batch);
        self.apply_deltas(deltas);
    }

    /// Runs `deltas` through the compiled graph, aggregates the output into
    /// per-key `{inserts, deletes, value}` counters, and reconciles against
    /// the current result set to produce insert/update/delete messages
    /// (spec.md §4.6). Updates `self.results` so `get`/`entries`/`values`
    /// stay current.
    fn apply_deltas(&self, deltas: HashMap<String, SourceBatch>) -> Vec<ChangeMessage> {
        let output = self.compiled.run(&deltas);

        let mut inserts: HashMap<String, i64> = HashMap::new();
        let mut deletes: HashMap<String, i64> = HashMap::new();
        let mut new_values: HashMap<String, Record> = HashMap::new();
        for (key, record, mult) in output {
            if mult > 0 {
                *inserts.entry(key.clone()).or_insert(0) += mult;
                new_values.insert(key, record);
            } else if mult < 0 {
                *deletes.entry(key).or_insert(0) += -mult;
            }
        }

        let mut messages = Vec::new();
        let mut results = self.results.borrow_mut();
        let keys: HashSet<String> = inserts.keys().chain(deletes.keys()).cloned().collect();
        for key in keys {
            let ins = inserts.get(&key).copied().unwrap_or(0);
            let del = deletes.get(&key).copied().unwrap_or(0);
            if ins > 0 && del == 0 {
                let value = new_values.remove(&key).unwrap_or_default();
                results.insert(key, value.clone());
                messages.push(ChangeMessage::Insert(value));
            } else if ins > 0 && ins >= del {
                let value = new_values.remove(&key).unwrap_or_default();
                let previous = results.insert(key, value.clone()).unwrap_or_default();
                messages.push(ChangeMessage::Update(previous, value));
            } else if del > ins {
                let previous = results.remove(&key).unwrap_or_default();
                messages.push(ChangeMessage::Delete(previous));
            }
        }
        messages
    }

    /// Detaches from every source collection and drops the graph's
    /// retained state (spec.md §5: "Unsubscribing ... detaches its change
    /// subscription on every source and drops the graph").
    pub fn close(&self) {
        for unsub in self.unsubscribes.borrow_mut().drain(..) {
            unsub.call();
        }
        *self.status.borrow_mut() = Status::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FromSource;
    use crate::value::Value;

    struct VecSource {
        records: RefCell<Vec<Record>>,
        listeners: RefCell<Vec<Rc<dyn Fn(&[ChangeMessage])>>>,
    }

    impl VecSource {
        fn new(records: Vec<Record>) -> Rc<Self> {
            Rc::new(VecSource {
                records: RefCell::new(records),
                listeners: RefCell::new(Vec::new()),
            })
        }

        fn push(&self, message: ChangeMessage) {
            match &message {
                ChangeMessage::Insert(v) => self.records.borrow_mut().push(v.clone()),
                ChangeMessage::Delete(v) => {
                    let key = self.get_key(v);
                    self.records.borrow_mut().retain(|r| self.get_key(r) != key);
                }
                ChangeMessage::Update(_, v) => {
                    let key = self.get_key(v);
                    let mut records = self.records.borrow_mut();
                    if let Some(slot) = records.iter_mut().find(|r| self.get_key(r) == key) {
                        *slot = v.clone();
                    }
                }
            }
            for listener in self.listeners.borrow().iter() {
                listener(&[message.clone()]);
            }
        }
    }

    impl SourceCollection for VecSource {
        fn get_key(&self, record: &Record) -> Key {
            match record.get("id") {
                Some(Value::Int(i)) => Key::Int(*i),
                _ => Key::String(String::new()),
            }
        }

        fn snapshot(&self) -> Vec<Record> {
            self.records.borrow().clone()
        }

        fn subscribe(&self, listener: Rc<dyn Fn(&[ChangeMessage])>) -> Unsubscribe {
            self.listeners.borrow_mut().push(listener);
            Unsubscribe::new(|| {})
        }
    }

    fn rec(fields: &[(&str, Value)]) -> Record {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn preload_becomes_ready_with_no_data() {
        let q = Query::new(FromSource::CollectionRef { collection: "users".into(), alias: "u".into() });
        let source = VecSource::new(vec![]);
        let mut sources: HashMap<String, Rc<dyn SourceCollection>> = HashMap::new();
        sources.insert("users".into(), source);
        let live = LiveQueryCollection::new("live-1", q, sources, &EngineConfig::default()).unwrap();
        LiveQueryCollection::preload(&live).await;
        assert_eq!(live.status(), Status::Ready);
        assert_eq!(live.size(), 0);
    }

    #[tokio::test]
    async fn filter_equality_scenario_emits_matching_keys() {
        let mut q = Query::new(FromSource::CollectionRef { collection: "users".into(), alias: "u".into() });
        q.filter.push(crate::ir::Expression::func(
            crate::ir::FuncName::Eq,
            vec![
                crate::ir::Expression::prop_ref(vec!["u".into(), "active".into()]).unwrap(),
                crate::ir::Expression::val(true),
            ],
        ));
        let source = VecSource::new(vec![
            rec(&[("id", Value::Int(1)), ("active", Value::Bool(true))]),
            rec(&[("id", Value::Int(2)), ("active", Value::Bool(false))]),
            rec(&[("id", Value::Int(3)), ("active", Value::Bool(true))]),
        ]);
        let mut sources: HashMap<String, Rc<dyn SourceCollection>> = HashMap::new();
        sources.insert("users".into(), source.clone());
        let live = LiveQueryCollection::new("live-1", q, sources, &EngineConfig::default()).unwrap();
        LiveQueryCollection::preload(&live).await;

        let mut keys: Vec<String> = live.entries().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["1".to_string(), "3".to_string()]);

        source.push(ChangeMessage::Update(
            rec(&[("id", Value::Int(3)), ("active", Value::Bool(true))]),
            rec(&[("id", Value::Int(3)), ("active", Value::Bool(false))]),
        ));
        let mut keys: Vec<String> = live.entries().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["1".to_string()]);
    }

    #[test]
    fn missing_source_collection_is_a_compile_error() {
        let q = Query::new(FromSource::CollectionRef { collection: "users".into(), alias: "u".into() });
        let sources: HashMap<String, Rc<dyn SourceCollection>> = HashMap::new();
        let err = LiveQueryCollection::new("live-1", q, sources, &EngineConfig::default()).unwrap_err();
        assert_eq!(err, CompileError::CollectionInputNotFound("users".to_string()));
    }
}
