//! # Compile-time error registry
//!
//! Stable, named error variants raised while validating, optimizing, or
//! compiling a query (spec.md §6). Every variant name here is part of the
//! public contract: application code is expected to match on them, so they
//! are never renamed once shipped, mirroring the teacher's
//! `ResourceError`/`TimeoutError` style of named, `thiserror`-derived
//! variants rather than string-typed errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("reference path is empty")]
    EmptyReferencePath,

    #[error("unknown expression type: {0}")]
    UnknownExpressionType(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unsupported aggregate function: {0}")]
    UnsupportedAggregateFunction(String),

    #[error("unsupported join type: {0}")]
    UnsupportedJoinType(String),

    #[error("unsupported join source type: {0}")]
    UnsupportedJoinSourceType(String),

    #[error("collection input not found: {0}")]
    CollectionInputNotFound(String),

    #[error("join condition references the same table on both sides: {0}")]
    InvalidJoinConditionSameTable(String),

    #[error("join condition references a table that is not part of this join: {0}")]
    InvalidJoinConditionTableMismatch(String),

    #[error("join condition does not reference exactly the main and joined tables: {0}")]
    InvalidJoinConditionWrongTables(String),

    #[error("aggregate function used in HAVING/ORDER BY is not present in SELECT: {0}")]
    AggregateFunctionNotInSelect(String),

    #[error("non-aggregate expression in SELECT is not present in GROUP BY: {0}")]
    NonAggregateExpressionNotInGroupBy(String),

    #[error("unknown expression type in HAVING clause: {0}")]
    UnknownHavingExpressionType(String),

    #[error("LIMIT/OFFSET used without ORDER BY")]
    LimitOffsetWithoutOrderBy,
}

pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_are_stable() {
        assert_eq!(
            CompileError::LimitOffsetWithoutOrderBy.to_string(),
            "LIMIT/OFFSET used without ORDER BY"
        );
    }
}
