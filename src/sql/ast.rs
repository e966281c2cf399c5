//! SQL expression tree.
//!
//! A small, composable AST covering exactly the SELECT shapes the ORM
//! emits: columns, parameterized values, comparison and logical
//! expressions, aggregates with FILTER, subqueries, joins, ordering and
//! common table expressions (plain and recursive). Nodes are plain values;
//! rendering happens in [`crate::sql::compiler`].

use crate::value::SqlValue;

/// Reference to a table, optionally aliased.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    pub fn aliased(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    /// The name other expressions should qualify columns with.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Reference to a column, optionally qualified and aliased.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub name: String,
    pub table: Option<String>,
    pub alias: Option<String>,
}

impl ColumnRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            alias: None,
        }
    }

    pub fn qualified(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: Some(table.into()),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl BinaryOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Full => "FULL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// A literal in an expression. Non-inline literals compile to `$N`
/// placeholders; inline literals are rendered directly into the SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: SqlValue,
    pub inline: bool,
    pub cast: Option<String>,
}

/// Function call, covering plain functions and aggregates with
/// `DISTINCT` / `FILTER (WHERE …)` / `AS alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub distinct: bool,
    pub filter_where: Option<Box<Expr>>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InList {
    Values(Vec<SqlValue>),
    Subquery(Box<SelectQuery>),
}

/// The expression sum type.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Value(Literal),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    In {
        value: Box<Expr>,
        options: InList,
    },
    Between {
        value: Box<Expr>,
        lower: Box<Expr>,
        upper: Box<Expr>,
    },
    Like {
        value: Box<Expr>,
        pattern: Box<Expr>,
    },
    Function(FuncCall),
    Coalesce {
        values: Vec<Expr>,
        alias: Option<String>,
    },
    Subquery {
        query: Box<SelectQuery>,
        alias: Option<String>,
    },
    /// Verbatim SQL fragment. Used for the recursive branch-hierarchy CTE
    /// body, which needs UNION ALL — a shape the tree does not otherwise
    /// model.
    Raw(String),
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column(ColumnRef::new(name))
    }

    pub fn qual_col(table: impl Into<String>, name: impl Into<String>) -> Expr {
        Expr::Column(ColumnRef::qualified(name, table))
    }

    /// A parameterized value: compiles to `$N`.
    pub fn param(value: impl Into<SqlValue>) -> Expr {
        Expr::Value(Literal {
            value: value.into(),
            inline: false,
            cast: None,
        })
    }

    /// An inline literal: rendered into the SQL text.
    pub fn inline(value: impl Into<SqlValue>) -> Expr {
        Expr::Value(Literal {
            value: value.into(),
            inline: true,
            cast: None,
        })
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    pub fn ne(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Ne, left, right)
    }

    pub fn gt(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Gt, left, right)
    }

    pub fn gte(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Gte, left, right)
    }

    pub fn lt(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Lt, left, right)
    }

    pub fn lte(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Lte, left, right)
    }

    pub fn is_null(expr: Expr) -> Expr {
        Expr::IsNull(Box::new(expr))
    }

    pub fn in_values(value: Expr, options: Vec<SqlValue>) -> Expr {
        Expr::In {
            value: Box::new(value),
            options: InList::Values(options),
        }
    }

    pub fn between(value: Expr, lower: Expr, upper: Expr) -> Expr {
        Expr::Between {
            value: Box::new(value),
            lower: Box::new(lower),
            upper: Box::new(upper),
        }
    }

    pub fn like(value: Expr, pattern: Expr) -> Expr {
        Expr::Like {
            value: Box::new(value),
            pattern: Box::new(pattern),
        }
    }

    /// Conjoin two expressions, flattening nested ANDs.
    pub fn and(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::And(mut left), Expr::And(right)) => {
                left.extend(right);
                Expr::And(left)
            }
            (Expr::And(mut conds), other) => {
                conds.push(other);
                Expr::And(conds)
            }
            (this, Expr::And(mut conds)) => {
                conds.insert(0, this);
                Expr::And(conds)
            }
            (this, other) => Expr::And(vec![this, other]),
        }
    }

    /// Disjoin two expressions, flattening nested ORs.
    pub fn or(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::Or(mut left), Expr::Or(right)) => {
                left.extend(right);
                Expr::Or(left)
            }
            (Expr::Or(mut conds), other) => {
                conds.push(other);
                Expr::Or(conds)
            }
            (this, Expr::Or(mut conds)) => {
                conds.insert(0, this);
                Expr::Or(conds)
            }
            (this, other) => Expr::Or(vec![this, other]),
        }
    }

    pub fn negate(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Function(FuncCall {
            name: name.into(),
            args,
            distinct: false,
            filter_where: None,
            alias: None,
        })
    }

    pub fn coalesce(values: Vec<Expr>, alias: Option<String>) -> Expr {
        Expr::Coalesce { values, alias }
    }
}

impl std::ops::BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        self.and(rhs)
    }
}

impl std::ops::BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        self.or(rhs)
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        self.negate()
    }
}

/// Build `jsonb_build_object('k1', v1, 'k2', v2, …)` from key/value pairs.
pub fn jsonb_build_object(pairs: Vec<(String, Expr)>) -> Expr {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for (key, value) in pairs {
        args.push(Expr::inline(key));
        args.push(value);
    }
    Expr::function("jsonb_build_object", args)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: Direction::Asc,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: Direction::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table(TableRef),
    Subquery { query: Box<SelectQuery>, alias: String },
}

impl FromItem {
    pub fn reference(&self) -> &str {
        match self {
            FromItem::Table(t) => t.reference(),
            FromItem::Subquery { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: FromItem,
    pub condition: Expr,
    pub kind: JoinKind,
}

/// Body of a common table expression.
#[derive(Debug, Clone, PartialEq)]
pub enum CteBody {
    Select(SelectQuery),
    /// Raw body for shapes the tree does not model (UNION ALL recursion).
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub body: CteBody,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Distinct {
    #[default]
    None,
    All,
    On(Vec<Expr>),
}

/// A SELECT statement under construction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub ctes: Vec<Cte>,
    pub distinct: Distinct,
    pub columns: Vec<Expr>,
    pub from: Option<FromItem>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: TableRef) -> Self {
        Self {
            from: Some(FromItem::Table(table)),
            ..Self::default()
        }
    }

    pub fn from_subquery(query: SelectQuery, alias: impl Into<String>) -> Self {
        Self {
            from: Some(FromItem::Subquery {
                query: Box::new(query),
                alias: alias.into(),
            }),
            ..Self::default()
        }
    }

    /// Conjoin a predicate with any existing WHERE clause.
    pub fn add_where(&mut self, expr: Expr) {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
    }

    pub fn add_join(&mut self, table: FromItem, condition: Expr, kind: JoinKind) {
        self.joins.push(Join {
            table,
            condition,
            kind,
        });
    }

    /// Prepend a CTE; earlier CTEs may be referenced by later ones.
    pub fn prepend_cte(&mut self, name: impl Into<String>, body: CteBody, recursive: bool) {
        self.ctes.insert(
            0,
            Cte {
                name: name.into(),
                body,
                recursive,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_flattens() {
        let expr = Expr::col("a").and(Expr::col("b")).and(Expr::col("c"));
        match expr {
            Expr::And(conds) => assert_eq!(conds.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn bit_ops_compose() {
        let expr = (Expr::col("a") & Expr::col("b")) | !Expr::col("c");
        match expr {
            Expr::Or(conds) => {
                assert_eq!(conds.len(), 2);
                assert!(matches!(conds[0], Expr::And(_)));
                assert!(matches!(conds[1], Expr::Not(_)));
            }
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn add_where_conjoins() {
        let mut q = SelectQuery::from_table(TableRef::new("users"));
        q.add_where(Expr::eq(Expr::col("a"), Expr::param(1i64)));
        q.add_where(Expr::eq(Expr::col("b"), Expr::param(2i64)));
        assert!(matches!(q.where_clause, Some(Expr::And(_))));
    }

    #[test]
    fn jsonb_object_interleaves_keys() {
        let expr = jsonb_build_object(vec![
            ("id".to_string(), Expr::col("id")),
            ("name".to_string(), Expr::col("name")),
        ]);
        match expr {
            Expr::Function(f) => {
                assert_eq!(f.name, "jsonb_build_object");
                assert_eq!(f.args.len(), 4);
            }
            other => panic!("expected Function, got {other:?}"),
        }
    }
}
