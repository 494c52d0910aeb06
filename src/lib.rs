//! # flowquery
//!
//! A reactive relational query engine over in-memory collections (spec.md
//! §1): compose SQL-like queries — FROM/JOIN/WHERE/GROUP BY/HAVING/ORDER BY/
//! LIMIT/OFFSET/SELECT, including subqueries — against named collections of
//! keyed records, and get back a [`driver::LiveQueryCollection`] whose
//! contents update incrementally as source collections change.
//!
//! ## Pipeline
//!
//! ```text
//! Query IR (ir)
//!     -> Optimizer (optimizer): predicate pushdown, subquery flattening
//!     -> Query compiler (compiler): lowers onto a dataflow graph (dataflow)
//!     -> Live-collection driver (driver): feeds source changes through the
//!        graph, aggregates output into insert/update/delete messages
//! ```
//!
//! ## Module organization
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`value`] | JSON-compatible scalar values, keys, records |
//! | [`errors`] | Compile-time error registry (spec.md §6) |
//! | [`ir`] | Query/expression IR and the query builder façade |
//! | [`expr`] | Compiles IR expressions into evaluator closures |
//! | [`optimizer`] | Predicate pushdown and subquery flattening |
//! | [`dataflow`] | The incremental dataflow runtime (map/filter/join/…) |
//! | [`compiler`] | Lowers optimized IR onto the dataflow runtime |
//! | [`driver`] | Live-collection driver and source-collection contract |
//! | [`fractional_index`] | ORDER_INDEX string key allocation |
//! | [`config`] | `EngineConfig` (optimizer bound, ORDER_INDEX mode, …) |

pub mod compiler;
pub mod config;
pub mod dataflow;
pub mod driver;
pub mod errors;
pub mod expr;
pub mod fractional_index;
pub mod ir;
pub mod optimizer;
pub mod value;

use crate::config::EngineConfig;
use crate::driver::{LiveQueryCollection, SourceCollection};
use crate::errors::CompileError;
use crate::ir::Query;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use crate::errors::{CompileError as Error, CompileResult};
pub use crate::value::{Key, Record, Value};

/// Top-level facade: holds engine-instance-scoped configuration and the
/// monotonic counter for auto-generated live-query ids (spec.md §9:
/// "Global counters ... scope it to the engine instance to avoid leaks in
/// tests").
pub struct QueryEngine {
    config: EngineConfig,
    next_live_id: AtomicU64,
}

impl QueryEngine {
    pub fn new(config: EngineConfig) -> Self {
        QueryEngine { config, next_live_id: AtomicU64::new(0) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiles `query` and wires it to `sources`. `id` defaults to
    /// `"<live_id_prefix>-N"`, monotonically counted per engine instance
    /// (spec.md §4.6).
    pub fn live_query(
        &self,
        id: Option<String>,
        query: Query,
        sources: HashMap<String, Rc<dyn SourceCollection>>,
    ) -> Result<Rc<LiveQueryCollection>, CompileError> {
        let id = id.unwrap_or_else(|| {
            let n = self.next_live_id.fetch_add(1, Ordering::Relaxed);
            format!("{}-{n}", self.config.live_id_prefix)
        });
        LiveQueryCollection::new(id, query, sources, &self.config)
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        QueryEngine::new(EngineConfig::default())
    }
}
