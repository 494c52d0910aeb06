//! Query builder façade (spec.md component 7: "fluent construction of IR
//! from typed refs; not behaviorally essential"). A thin layer over
//! `Query`/`Expression` construction; it carries no semantics beyond what
//! the IR already encodes, mirroring the teacher's `AtomBuilder`/
//! `RuleBuilder` fluent style.

use super::{
    AggregateFunc, Expression, FromSource, JoinClause, JoinType, OrderByEntry, Query, SelectEntry,
};
use crate::errors::CompileError;
use crate::value::Value;

/// Typed reference to a column on an aliased source, used to record
/// `PropRef` paths without requiring callers to build `Vec<String>` by
/// hand (spec.md §9: "expose a typed reference object whose field access
/// returns a builder that records the path").
#[derive(Debug, Clone)]
pub struct ColumnRef {
    alias: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>) -> Self {
        ColumnRef { alias: alias.into() }
    }

    pub fn field(&self, name: &str) -> Expression {
        Expression::PropRef(vec![self.alias.clone(), name.to_string()])
    }
}

pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn from_collection(collection: impl Into<String>, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        QueryBuilder {
            query: Query::new(FromSource::CollectionRef {
                collection: collection.into(),
                alias,
            }),
        }
    }

    pub fn from_query(inner: Query, alias: impl Into<String>) -> Self {
        QueryBuilder {
            query: Query::new(FromSource::QueryRef {
                query: std::rc::Rc::new(inner),
                alias: alias.into(),
            }),
        }
    }

    pub fn join(mut self, from: FromSource, join_type: JoinType, left: Expression, right: Expression) -> Self {
        self.query.join.push(JoinClause {
            from,
            join_type,
            left,
            right,
        });
        self
    }

    pub fn filter(mut self, predicate: Expression) -> Self {
        self.query.filter.push(predicate);
        self
    }

    pub fn select(mut self, alias: impl Into<String>, expr: Expression) -> Self {
        self.query.select.push(SelectEntry {
            alias: alias.into(),
            expression: expr,
        });
        self
    }

    pub fn group_by(mut self, expr: Expression) -> Self {
        self.query.group_by.push(expr);
        self
    }

    pub fn having(mut self, predicate: Expression) -> Self {
        self.query.having.push(predicate);
        self
    }

    pub fn order_by(mut self, entry: OrderByEntry) -> Self {
        self.query.order_by.push(entry);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.query.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.query.offset = Some(n);
        self
    }

    pub fn build(self) -> Result<Query, CompileError> {
        self.query.validate_shape()?;
        Ok(self.query)
    }
}

pub fn col(alias: impl Into<String>) -> ColumnRef {
    ColumnRef::new(alias)
}

pub fn val(v: impl Into<Value>) -> Expression {
    Expression::val(v)
}

pub fn sum(arg: Expression) -> Expression {
    Expression::aggregate(AggregateFunc::Sum, vec![arg])
}

pub fn count(arg: Expression) -> Expression {
    Expression::aggregate(AggregateFunc::Count, vec![arg])
}

pub fn avg(arg: Expression) -> Expression {
    Expression::aggregate(AggregateFunc::Avg, vec![arg])
}

pub fn min(arg: Expression) -> Expression {
    Expression::aggregate(AggregateFunc::Min, vec![arg])
}

pub fn max(arg: Expression) -> Expression {
    Expression::aggregate(AggregateFunc::Max, vec![arg])
}
