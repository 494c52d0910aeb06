//! # IR & expression model
//!
//! Tagged, immutable variants for query nodes and expressions (spec.md §3,
//! §4.2). Structural equality is derived so the optimizer can match
//! aggregates between `HAVING` and `SELECT` (spec.md §4.2: "used by the
//! optimizer to match aggregates"). Everything here is a closed enum -
//! "Tagged variants over inheritance" (spec.md §9).

pub mod builders;

use crate::errors::CompileError;
use crate::value::Value;
use std::rc::Rc;

/// Join types accepted at the IR level (spec.md §6). `cross` and `outer`
/// are surface aliases normalized by the compiler (`cross`->inner,
/// `outer`->full; spec.md §4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
    Outer,
}

impl JoinType {
    /// Parses a surface join-type name. Unknown names are a compile error
    /// (`UnsupportedJoinType`, spec.md §6) rather than a panic, since query
    /// IR may be built from a string-based surface (e.g. a deserialized
    /// query document) as well as the typed builder façade.
    pub fn parse(name: &str) -> Result<Self, CompileError> {
        match name {
            "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full" => Ok(JoinType::Full),
            "cross" => Ok(JoinType::Cross),
            "outer" => Ok(JoinType::Outer),
            other => Err(CompileError::UnsupportedJoinType(other.to_string())),
        }
    }

    /// Normalizes surface aliases to the two runtime join shapes the
    /// dataflow `join` operator understands (spec.md §4.5 step 4).
    pub fn normalize(self) -> RuntimeJoinType {
        match self {
            JoinType::Inner | JoinType::Cross => RuntimeJoinType::Inner,
            JoinType::Left => RuntimeJoinType::Left,
            JoinType::Right => RuntimeJoinType::Right,
            JoinType::Full | JoinType::Outer => RuntimeJoinType::Full,
        }
    }

    pub fn is_cross(self) -> bool {
        matches!(self, JoinType::Cross)
    }
}

/// The two runtime join shapes the dataflow join operator implements
/// (spec.md §4.1): everything else normalizes into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeJoinType {
    Inner,
    Left,
    Right,
    Full,
}

/// Closed expression-function registry (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncName {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    In,
    Like,
    Ilike,
    Upper,
    Lower,
    Length,
    Concat,
    Coalesce,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl FuncName {
    pub fn parse(name: &str) -> Result<Self, CompileError> {
        use FuncName::*;
        Ok(match name {
            "eq" => Eq,
            "gt" => Gt,
            "gte" => Gte,
            "lt" => Lt,
            "lte" => Lte,
            "and" => And,
            "or" => Or,
            "not" => Not,
            "in" => In,
            "like" => Like,
            "ilike" => Ilike,
            "upper" => Upper,
            "lower" => Lower,
            "length" => Length,
            "concat" => Concat,
            "coalesce" => Coalesce,
            "add" => Add,
            "subtract" => Subtract,
            "multiply" => Multiply,
            "divide" => Divide,
            other => return Err(CompileError::UnknownFunction(other.to_string())),
        })
    }

    pub fn as_str(self) -> &'static str {
        use FuncName::*;
        match self {
            Eq => "eq",
            Gt => "gt",
            Gte => "gte",
            Lt => "lt",
            Lte => "lte",
            And => "and",
            Or => "or",
            Not => "not",
            In => "in",
            Like => "like",
            Ilike => "ilike",
            Upper => "upper",
            Lower => "lower",
            Length => "length",
            Concat => "concat",
            Coalesce => "coalesce",
            Add => "add",
            Subtract => "subtract",
            Multiply => "multiply",
            Divide => "divide",
        }
    }
}

/// Closed aggregate registry (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunc {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn parse(name: &str) -> Result<Self, CompileError> {
        use AggregateFunc::*;
        Ok(match name {
            "sum" => Sum,
            "count" => Count,
            "avg" => Avg,
            "min" => Min,
            "max" => Max,
            other => return Err(CompileError::UnsupportedAggregateFunction(other.to_string())),
        })
    }

    pub fn as_str(self) -> &'static str {
        use AggregateFunc::*;
        match self {
            Sum => "sum",
            Count => "count",
            Avg => "avg",
            Min => "min",
            Max => "max",
        }
    }
}

/// Expression IR (spec.md §3). `Aggregate` is only valid in `select` or
/// (post-rewrite) `having`; the optimizer and compiler enforce that, the
/// type itself does not.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Val(Value),
    /// `path[0]` is the alias; the remainder is a field path into that
    /// alias's record. Single-field paths are `[alias, field]`.
    PropRef(Vec<String>),
    Func {
        name: FuncName,
        args: Vec<Expression>,
    },
    Aggregate {
        name: AggregateFunc,
        args: Vec<Expression>,
    },
    /// A `result.<alias>` reference produced by the HAVING rewrite
    /// (spec.md §4.5 step 5); never appears in user-constructed IR.
    ResultRef(String),
}

impl Expression {
    pub fn val(v: impl Into<Value>) -> Self {
        Expression::Val(v.into())
    }

    /// Builds a `PropRef`, validating the non-empty-path invariant
    /// (spec.md §3) at construction time.
    pub fn prop_ref(path: Vec<String>) -> Result<Self, CompileError> {
        if path.is_empty() {
            return Err(CompileError::EmptyReferencePath);
        }
        Ok(Expression::PropRef(path))
    }

    pub fn func(name: FuncName, args: Vec<Expression>) -> Self {
        Expression::Func { name, args }
    }

    pub fn aggregate(name: AggregateFunc, args: Vec<Expression>) -> Self {
        Expression::Aggregate { name, args }
    }

    /// The aliases an expression references, via its `PropRef` leaves
    /// (spec.md §4.4 rule 2, `sources()`).
    pub fn sources(&self) -> std::collections::BTreeSet<String> {
        let mut out = std::collections::BTreeSet::new();
        self.collect_sources(&mut out);
        out
    }

    fn collect_sources(&self, out: &mut std::collections::BTreeSet<String>) {
        match self {
            Expression::Val(_) | Expression::ResultRef(_) => {}
            Expression::PropRef(path) => {
                if let Some(alias) = path.first() {
                    if !alias.is_empty() {
                        out.insert(alias.clone());
                    }
                }
            }
            Expression::Func { args, .. } | Expression::Aggregate { args, .. } => {
                for a in args {
                    a.collect_sources(out);
                }
            }
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expression::Aggregate { .. })
    }

    /// Recursively searches for an aggregate subexpression anywhere inside
    /// this expression (used by the WHERE-forbids-aggregate check).
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expression::Aggregate { .. } => true,
            Expression::Func { args, .. } => args.iter().any(Expression::contains_aggregate),
            _ => false,
        }
    }
}

/// `From`/`JoinFrom` tagged variant (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub enum FromSource {
    CollectionRef { collection: String, alias: String },
    QueryRef { query: Rc<Query>, alias: String },
}

impl FromSource {
    pub fn alias(&self) -> &str {
        match self {
            FromSource::CollectionRef { alias, .. } => alias,
            FromSource::QueryRef { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub from: FromSource,
    pub join_type: JoinType,
    pub left: Expression,
    pub right: Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringSort {
    Lexical,
    Locale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByEntry {
    pub expression: Expression,
    pub direction: SortDirection,
    pub nulls: NullsOrder,
    pub string_sort: StringSort,
}

impl OrderByEntry {
    pub fn new(expression: Expression) -> Self {
        OrderByEntry {
            expression,
            direction: SortDirection::Asc,
            nulls: NullsOrder::Last,
            string_sort: StringSort::Lexical,
        }
    }
}

/// A `{alias: expression}` projection entry. SELECT and GROUP BY carry
/// lists of these (spec.md §3, §4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct SelectEntry {
    pub alias: String,
    pub expression: Expression,
}

/// Opaque functional callback markers. The optimizer treats these as
/// unsafe-to-pushdown-across boundaries (spec.md §9, Open Question b); the
/// callback body itself is not part of the IR, only its presence is
/// recorded so compilation can invoke it at the right pipeline stage.
pub type FnWhereCallback = Rc<dyn Fn(&std::collections::HashMap<String, crate::value::Record>) -> bool>;
pub type FnSelectCallback = Rc<dyn Fn(&std::collections::HashMap<String, crate::value::Record>) -> crate::value::Record>;
pub type FnHavingCallback = Rc<dyn Fn(&crate::value::Record) -> bool>;

#[derive(Clone, Default)]
pub struct FnCallbacks {
    pub fn_where: Option<FnWhereCallback>,
    pub fn_having: Option<FnHavingCallback>,
    pub fn_select: Option<FnSelectCallback>,
}

impl std::fmt::Debug for FnCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCallbacks")
            .field("fn_where", &self.fn_where.is_some())
            .field("fn_having", &self.fn_having.is_some())
            .field("fn_select", &self.fn_select.is_some())
            .finish()
    }
}

impl PartialEq for FnCallbacks {
    fn eq(&self, other: &Self) -> bool {
        self.fn_where.is_some() == other.fn_where.is_some()
            && self.fn_having.is_some() == other.fn_having.is_some()
            && self.fn_select.is_some() == other.fn_select.is_some()
    }
}

/// The query IR node (spec.md §3).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub from: Option<FromSource>,
    pub join: Vec<JoinClause>,
    pub filter: Vec<Expression>,
    pub select: Vec<SelectEntry>,
    pub group_by: Vec<Expression>,
    pub having: Vec<Expression>,
    pub order_by: Vec<OrderByEntry>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub callbacks: FnCallbacks,
}

impl Query {
    pub fn new(from: FromSource) -> Self {
        Query {
            from: Some(from),
            ..Default::default()
        }
    }

    pub fn has_aggregates(&self) -> bool {
        self.select.iter().any(|e| e.expression.contains_aggregate()) || !self.group_by.is_empty()
    }

    /// Validates the structural invariants spec.md §3 lists that do not
    /// depend on alias scoping (that part is checked by the compiler,
    /// which has the scope available): WHERE forbids aggregates, and
    /// LIMIT/OFFSET require ORDER BY.
    pub fn validate_shape(&self) -> Result<(), CompileError> {
        if self.filter.iter().any(Expression::contains_aggregate) {
            return Err(CompileError::UnknownExpressionType(
                "aggregate not allowed in WHERE".to_string(),
            ));
        }
        if (self.limit.is_some() || self.offset.is_some()) && self.order_by.is_empty() {
            return Err(CompileError::LimitOffsetWithoutOrderBy);
        }
        Ok(())
    }

    /// Every alias in scope at the outer level of this query: the FROM
    /// alias plus every JOIN alias.
    pub fn aliases_in_scope(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(from) = &self.from {
            out.push(from.alias().to_string());
        }
        for j in &self.join {
            out.push(j.from.alias().to_string());
        }
        out
    }
}
