//! AST → SQL renderer.
//!
//! Walks a [`SelectQuery`], allocating `$N` placeholders for every
//! non-inline value and collecting the bound parameters in order. One
//! counter is shared across the whole tree — subqueries and CTE bodies
//! continue the outer numbering, so the emitted placeholders always run
//! `$1..$N` with no gaps. Precedence is handled by parenthesizing every
//! composite expression; no precedence table is consulted.

use crate::error::{Error, Result};
use crate::sql::ast::{
    ColumnRef, CteBody, Distinct, Expr, FromItem, FuncCall, InList, Literal, SelectQuery,
};
use crate::value::SqlValue;

/// A rendered statement: SQL text plus its bound parameters, in
/// placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Default)]
pub struct Compiler {
    params: Vec<SqlValue>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(mut self, query: &SelectQuery) -> Result<Compiled> {
        let sql = self.compile_select(query)?;
        Ok(Compiled {
            sql,
            params: self.params,
        })
    }

    fn add_param(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    fn compile_select(&mut self, q: &SelectQuery) -> Result<String> {
        if q.from.is_none() && !q.columns.is_empty() && q.ctes.is_empty() {
            return Err(Error::compile("SELECT with columns but no FROM"));
        }

        let mut sql = String::new();

        if !q.ctes.is_empty() {
            let recursive = q.ctes.iter().any(|c| c.recursive);
            sql.push_str(if recursive { "WITH RECURSIVE " } else { "WITH " });
            let mut parts = Vec::with_capacity(q.ctes.len());
            for cte in &q.ctes {
                let body = match &cte.body {
                    CteBody::Select(inner) => self.compile_select(inner)?,
                    CteBody::Raw(raw) => raw.clone(),
                };
                parts.push(format!("{} AS ({})", cte.name, body));
            }
            sql.push_str(&parts.join(", "));
            sql.push(' ');
        }

        sql.push_str("SELECT ");
        match &q.distinct {
            Distinct::None => {}
            Distinct::All => sql.push_str("DISTINCT "),
            Distinct::On(cols) => {
                let keys = cols
                    .iter()
                    .map(|c| self.compile_expr(c))
                    .collect::<Result<Vec<_>>>()?;
                sql.push_str(&format!("DISTINCT ON ({}) ", keys.join(", ")));
            }
        }

        if q.columns.is_empty() {
            sql.push('*');
        } else {
            let cols = q
                .columns
                .iter()
                .map(|c| self.compile_expr(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&cols.join(", "));
        }

        if let Some(from) = &q.from {
            sql.push_str(" FROM ");
            sql.push_str(&self.compile_from(from)?);
        }

        for join in &q.joins {
            sql.push_str(&format!(
                " {} JOIN {} ON {}",
                join.kind.as_sql(),
                self.compile_from(&join.table)?,
                self.compile_expr(&join.condition)?
            ));
        }

        if let Some(where_clause) = &q.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.compile_expr(where_clause)?);
        }

        if !q.group_by.is_empty() {
            let keys = q
                .group_by
                .iter()
                .map(|c| self.compile_expr(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&keys.join(", "));
        }

        if let Some(having) = &q.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.compile_expr(having)?);
        }

        if !q.order_by.is_empty() {
            let orders = q
                .order_by
                .iter()
                .map(|o| {
                    Ok(format!(
                        "{} {}",
                        self.compile_expr(&o.expr)?,
                        o.direction.as_sql()
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }

        if let Some(limit) = q.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = q.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        Ok(sql)
    }

    fn compile_from(&mut self, from: &FromItem) -> Result<String> {
        match from {
            FromItem::Table(t) => Ok(match &t.alias {
                Some(alias) => format!("{} AS {}", t.name, alias),
                None => t.name.clone(),
            }),
            FromItem::Subquery { query, alias } => {
                let inner = self.compile_select(query)?;
                Ok(format!("({inner}) AS {alias}"))
            }
        }
    }

    fn compile_column(&self, col: &ColumnRef) -> String {
        let mut out = match &col.table {
            Some(table) => format!("{}.{}", table, col.name),
            None => col.name.clone(),
        };
        if let Some(alias) = &col.alias {
            out.push_str(" AS ");
            out.push_str(alias);
        }
        out
    }

    fn compile_literal(&mut self, lit: &Literal) -> Result<String> {
        let mut out = if lit.inline {
            lit.value.render_inline().ok_or_else(|| {
                Error::compile(format!("value {:?} cannot be rendered inline", lit.value))
            })?
        } else {
            self.add_param(lit.value.clone())
        };
        if let Some(cast) = &lit.cast {
            out.push_str("::");
            out.push_str(cast);
        }
        Ok(out)
    }

    fn compile_function(&mut self, f: &FuncCall) -> Result<String> {
        let mut args = f
            .args
            .iter()
            .map(|a| self.compile_expr(a))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        if f.distinct {
            args = format!("DISTINCT {args}");
        }
        let mut out = format!("{}({})", f.name, args);
        if let Some(filter) = &f.filter_where {
            out.push_str(&format!(" FILTER (WHERE {})", self.compile_expr(filter)?));
        }
        if let Some(alias) = &f.alias {
            out.push_str(&format!(" AS {alias}"));
        }
        Ok(out)
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Column(col) => Ok(self.compile_column(col)),
            Expr::Value(lit) => self.compile_literal(lit),
            Expr::Binary { op, left, right } => Ok(format!(
                "({} {} {})",
                self.compile_expr(left)?,
                op.as_sql(),
                self.compile_expr(right)?
            )),
            Expr::And(conds) => {
                let parts = conds
                    .iter()
                    .map(|c| self.compile_expr(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(" AND ")))
            }
            Expr::Or(conds) => {
                let parts = conds
                    .iter()
                    .map(|c| self.compile_expr(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(" OR ")))
            }
            Expr::Not(inner) => Ok(format!("(NOT {})", self.compile_expr(inner)?)),
            Expr::IsNull(inner) => Ok(format!("({} IS NULL)", self.compile_expr(inner)?)),
            Expr::In { value, options } => {
                let value_sql = self.compile_expr(value)?;
                let options_sql = match options {
                    InList::Values(values) => values
                        .iter()
                        .map(|v| self.add_param(v.clone()))
                        .collect::<Vec<_>>()
                        .join(", "),
                    InList::Subquery(query) => self.compile_select(query)?,
                };
                Ok(format!("({value_sql} IN ({options_sql}))"))
            }
            Expr::Between {
                value,
                lower,
                upper,
            } => Ok(format!(
                "({} BETWEEN {} AND {})",
                self.compile_expr(value)?,
                self.compile_expr(lower)?,
                self.compile_expr(upper)?
            )),
            Expr::Like { value, pattern } => Ok(format!(
                "({} LIKE {})",
                self.compile_expr(value)?,
                self.compile_expr(pattern)?
            )),
            Expr::Function(f) => self.compile_function(f),
            Expr::Coalesce { values, alias } => {
                let args = values
                    .iter()
                    .map(|v| self.compile_expr(v))
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                let mut out = format!("COALESCE({args})");
                if let Some(alias) = alias {
                    out.push_str(&format!(" AS {alias}"));
                }
                Ok(out)
            }
            Expr::Subquery { query, alias } => {
                let inner = self.compile_select(query)?;
                Ok(match alias {
                    Some(alias) => format!("({inner}) AS {alias}"),
                    None => format!("({inner})"),
                })
            }
            Expr::Raw(raw) => Ok(raw.clone()),
        }
    }
}

/// Count `$N` placeholders in a SQL string. Test helper for the
/// placeholder/parameter-count contract.
#[cfg(test)]
pub(crate) fn count_placeholders(sql: &str) -> usize {
    let mut seen = std::collections::HashSet::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    seen.insert(n);
                }
            }
            i = end;
        } else {
            i += 1;
        }
    }
    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::{Direction, JoinKind, OrderBy, TableRef};
    use pretty_assertions::assert_eq;

    fn users() -> TableRef {
        TableRef::aliased("users", "u")
    }

    #[test]
    fn simple_select_with_param() {
        let mut q = SelectQuery::from_table(users());
        q.columns = vec![
            Expr::qual_col("u", "id"),
            Expr::qual_col("u", "name"),
            Expr::qual_col("u", "age"),
        ];
        q.add_where(Expr::gt(Expr::qual_col("u", "age"), Expr::param(21i64)));

        let compiled = Compiler::new().compile(&q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT u.id, u.name, u.age FROM users AS u WHERE (u.age > $1)"
        );
        assert_eq!(compiled.params, vec![SqlValue::Int(21)]);
    }

    #[test]
    fn placeholders_match_params_without_gaps() {
        let mut q = SelectQuery::from_table(users());
        q.columns = vec![Expr::qual_col("u", "id")];
        q.add_where(
            Expr::eq(Expr::qual_col("u", "name"), Expr::param("alice"))
                .and(Expr::in_values(
                    Expr::qual_col("u", "age"),
                    vec![SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(3)],
                ))
                .and(Expr::between(
                    Expr::qual_col("u", "id"),
                    Expr::param(10i64),
                    Expr::param(20i64),
                )),
        );

        let compiled = Compiler::new().compile(&q).unwrap();
        assert_eq!(compiled.params.len(), 6);
        assert_eq!(count_placeholders(&compiled.sql), compiled.params.len());
        assert!(compiled.sql.contains("$6"));
    }

    #[test]
    fn subquery_continues_outer_numbering() {
        let mut inner = SelectQuery::from_table(TableRef::aliased("posts", "p"));
        inner.columns = vec![Expr::qual_col("p", "user_id")];
        inner.add_where(Expr::eq(Expr::qual_col("p", "title"), Expr::param("x")));

        let mut q = SelectQuery::from_table(users());
        q.columns = vec![Expr::qual_col("u", "id")];
        q.add_where(
            Expr::eq(Expr::qual_col("u", "name"), Expr::param("alice")).and(Expr::In {
                value: Box::new(Expr::qual_col("u", "id")),
                options: InList::Subquery(Box::new(inner)),
            }),
        );

        let compiled = Compiler::new().compile(&q).unwrap();
        assert_eq!(compiled.params.len(), 2);
        assert!(compiled.sql.contains("$2"));
        assert!(!compiled.sql.contains("$3"));
    }

    #[test]
    fn missing_from_with_columns_is_an_error() {
        let mut q = SelectQuery::new();
        q.columns = vec![Expr::col("id")];
        let err = Compiler::new().compile(&q).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn inline_strings_are_quoted() {
        let mut q = SelectQuery::from_table(users());
        q.columns = vec![Expr::qual_col("u", "id")];
        q.add_where(Expr::eq(Expr::qual_col("u", "name"), Expr::inline("o'brien")));

        let compiled = Compiler::new().compile(&q).unwrap();
        assert!(compiled.sql.contains("'o''brien'"));
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn distinct_on_renders_keys() {
        let mut q = SelectQuery::from_table(TableRef::new("notes"));
        q.distinct = Distinct::On(vec![Expr::col("artifact_id")]);
        q.order_by = vec![
            OrderBy::desc(Expr::col("artifact_id")),
            OrderBy::desc(Expr::col("version")),
        ];

        let compiled = Compiler::new().compile(&q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT DISTINCT ON (artifact_id) * FROM notes ORDER BY artifact_id DESC, version DESC"
        );
    }

    #[test]
    fn recursive_cte_comes_first() {
        let mut q = SelectQuery::from_table(TableRef::aliased("turns", "t"));
        q.columns = vec![Expr::qual_col("t", "id")];
        q.prepend_cte(
            "branch_hierarchy",
            CteBody::Raw("SELECT 1".to_string()),
            true,
        );

        let compiled = Compiler::new().compile(&q).unwrap();
        assert!(compiled
            .sql
            .starts_with("WITH RECURSIVE branch_hierarchy AS (SELECT 1) SELECT"));
    }

    #[test]
    fn aggregate_with_filter_and_alias() {
        let agg = Expr::Function(FuncCall {
            name: "json_agg".into(),
            args: vec![Expr::qual_col("p", "id")],
            distinct: true,
            filter_where: Some(Box::new(Expr::Not(Box::new(Expr::is_null(
                Expr::qual_col("p", "id"),
            ))))),
            alias: None,
        });
        let col = Expr::coalesce(vec![agg, Expr::inline("[]")], Some("posts".into()));

        let mut q = SelectQuery::from_table(users());
        q.columns = vec![Expr::qual_col("u", "id"), col];
        q.add_join(
            FromItem::Table(TableRef::aliased("posts", "p")),
            Expr::eq(Expr::qual_col("u", "id"), Expr::qual_col("p", "user_id")),
            JoinKind::Left,
        );
        q.group_by = vec![Expr::qual_col("u", "id")];

        let compiled = Compiler::new().compile(&q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT u.id, COALESCE(json_agg(DISTINCT p.id) FILTER (WHERE (NOT (p.id IS NULL))), '[]') AS posts \
             FROM users AS u LEFT JOIN posts AS p ON (u.id = p.user_id) GROUP BY u.id"
        );
    }

    #[test]
    fn order_directions() {
        let mut q = SelectQuery::from_table(users());
        q.order_by = vec![
            OrderBy {
                expr: Expr::qual_col("u", "name"),
                direction: Direction::Asc,
            },
            OrderBy {
                expr: Expr::qual_col("u", "id"),
                direction: Direction::Desc,
            },
        ];
        q.limit = Some(5);
        q.offset = Some(10);

        let compiled = Compiler::new().compile(&q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT * FROM users AS u ORDER BY u.name ASC, u.id DESC LIMIT 5 OFFSET 10"
        );
    }
}
