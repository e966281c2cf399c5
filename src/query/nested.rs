//! Nested relation projections.
//!
//! A joined child query set becomes a JSON aggregate column on the parent
//! SELECT: one round-trip instead of N+1. Direct children are emitted as
//! `COALESCE(json_agg(DISTINCT jsonb_build_object(…)) FILTER (…), '[]')`
//! over a LEFT JOIN; grandchildren and deeper are emitted as correlated
//! subqueries so each aggregation is independent of sibling cardinality.

use std::sync::Arc;

use crate::error::Result;
use crate::schema::namespace::Namespace;
use crate::schema::relation::RelationInfo;
use crate::sql::ast::{
    jsonb_build_object, Direction, Expr, FromItem, FuncCall, JoinKind, OrderBy, SelectQuery,
    TableRef,
};

/// A pending child projection hanging off a parent query set.
#[derive(Debug, Clone)]
pub(crate) struct NestedSelect {
    pub rel: RelationInfo,
    pub ns: Arc<Namespace>,
    pub alias: String,
    /// Alias for the junction table, when the relation routes through one.
    pub junction_alias: Option<String>,
    pub columns: Vec<String>,
    pub where_extra: Option<Expr>,
    pub order_by: Vec<(String, Direction)>,
    pub nested: Vec<NestedSelect>,
}

impl NestedSelect {
    /// Attach this child at depth 1: LEFT JOINs on the parent query plus
    /// the aggregate projection column.
    pub fn attach(&self, query: &mut SelectQuery, parent_ref: &str) -> Result<()> {
        let child_pk = self.ns.primary_key()?.name.clone();

        match self.rel.junction() {
            Some((junction_table, local_key, other_key)) => {
                let junction_alias = self
                    .junction_alias
                    .clone()
                    .unwrap_or_else(|| junction_table.to_string());
                query.add_join(
                    FromItem::Table(TableRef::aliased(junction_table, junction_alias.clone())),
                    Expr::eq(
                        Expr::qual_col(parent_ref, &self.rel.primary_key),
                        Expr::qual_col(&junction_alias, local_key),
                    ),
                    JoinKind::Left,
                );
                let mut condition = Expr::eq(
                    Expr::qual_col(&self.alias, &child_pk),
                    Expr::qual_col(&junction_alias, other_key),
                );
                if let Some(extra) = &self.where_extra {
                    condition = condition.and(extra.clone());
                }
                query.add_join(
                    FromItem::Table(TableRef::aliased(
                        &self.rel.foreign_table,
                        self.alias.clone(),
                    )),
                    condition,
                    JoinKind::Left,
                );
            }
            None => {
                let mut condition = Expr::eq(
                    Expr::qual_col(parent_ref, &self.rel.primary_key),
                    Expr::qual_col(&self.alias, &self.rel.foreign_key),
                );
                if let Some(extra) = &self.where_extra {
                    condition = condition.and(extra.clone());
                }
                query.add_join(
                    FromItem::Table(TableRef::aliased(
                        &self.rel.foreign_table,
                        self.alias.clone(),
                    )),
                    condition,
                    JoinKind::Left,
                );
            }
        }

        let object = jsonb_build_object(self.object_pairs()?);
        let aggregate = Expr::Function(FuncCall {
            name: "json_agg".into(),
            args: vec![object],
            distinct: true,
            filter_where: Some(Box::new(Expr::Not(Box::new(Expr::is_null(
                Expr::qual_col(&self.alias, &child_pk),
            ))))),
            alias: None,
        });
        query.columns.push(Expr::coalesce(
            vec![aggregate, Expr::inline("[]")],
            Some(self.rel.name.clone()),
        ));
        Ok(())
    }

    /// The `'column', value` pairs for this child's JSON object, including
    /// one correlated subquery per grandchild.
    fn object_pairs(&self) -> Result<Vec<(String, Expr)>> {
        let mut pairs: Vec<(String, Expr)> = self
            .columns
            .iter()
            .map(|col| (col.clone(), Expr::qual_col(&self.alias, col)))
            .collect();
        for grandchild in &self.nested {
            pairs.push((
                grandchild.rel.name.clone(),
                grandchild.correlated_expr(&self.alias)?,
            ));
        }
        Ok(pairs)
    }

    /// This child as a correlated subquery against `outer_ref`, for
    /// depth ≥ 2 placement inside a parent's JSON object.
    fn correlated_expr(&self, outer_ref: &str) -> Result<Expr> {
        let child_pk = self.ns.primary_key()?.name.clone();
        let object = jsonb_build_object(self.object_pairs()?);

        // Link back to the outer row, routing through the junction for
        // many-to-many relations.
        let (joins, mut link) = match self.rel.junction() {
            Some((junction_table, local_key, other_key)) => {
                let junction_alias = self
                    .junction_alias
                    .clone()
                    .unwrap_or_else(|| junction_table.to_string());
                let join = (
                    FromItem::Table(TableRef::aliased(junction_table, junction_alias.clone())),
                    Expr::eq(
                        Expr::qual_col(&junction_alias, other_key),
                        Expr::qual_col(&self.alias, &child_pk),
                    ),
                );
                let link = Expr::eq(
                    Expr::qual_col(&junction_alias, local_key),
                    Expr::qual_col(outer_ref, &self.rel.primary_key),
                );
                (vec![join], link)
            }
            None => (
                Vec::new(),
                Expr::eq(
                    Expr::qual_col(&self.alias, &self.rel.foreign_key),
                    Expr::qual_col(outer_ref, &self.rel.primary_key),
                ),
            ),
        };
        if let Some(extra) = &self.where_extra {
            link = link.and(extra.clone());
        }

        let subquery = if self.order_by.is_empty() {
            let mut sub = SelectQuery::from_table(TableRef::aliased(
                &self.rel.foreign_table,
                self.alias.clone(),
            ));
            for (table, condition) in joins {
                sub.add_join(table, condition, JoinKind::Inner);
            }
            sub.add_where(link);
            sub.columns = vec![Expr::function("json_agg", vec![object])];
            sub
        } else {
            // Aggregation preserves the input order of an ordered inner
            // subselect.
            let mut inner = SelectQuery::from_table(TableRef::aliased(
                &self.rel.foreign_table,
                self.alias.clone(),
            ));
            inner.columns = vec![Expr::qual_col(&self.alias, "*")];
            for (table, condition) in joins {
                inner.add_join(table, condition, JoinKind::Inner);
            }
            inner.add_where(link);
            inner.order_by = self
                .order_by
                .iter()
                .map(|(col, direction)| OrderBy {
                    expr: Expr::qual_col(&self.alias, col),
                    direction: *direction,
                })
                .collect();

            let mut sub = SelectQuery::from_subquery(inner, self.alias.clone());
            sub.columns = vec![Expr::function("json_agg", vec![object])];
            sub
        };

        Ok(Expr::coalesce(
            vec![
                Expr::Subquery {
                    query: Box::new(subquery),
                    alias: None,
                },
                Expr::inline("[]"),
            ],
            None,
        ))
    }
}

/// Rewrite every table qualifier equal to `old` into `new`, recursively.
/// Used when a child query set built with its own aliases is grafted onto
/// a parent that assigns it a different alias.
pub(crate) fn rewrite_tables(expr: &mut Expr, old: &str, new: &str) {
    match expr {
        Expr::Column(col) => {
            if col.table.as_deref() == Some(old) {
                col.table = Some(new.to_string());
            }
        }
        Expr::Value(_) | Expr::Raw(_) => {}
        Expr::Binary { left, right, .. } => {
            rewrite_tables(left, old, new);
            rewrite_tables(right, old, new);
        }
        Expr::And(conds) | Expr::Or(conds) => {
            for cond in conds {
                rewrite_tables(cond, old, new);
            }
        }
        Expr::Not(inner) | Expr::IsNull(inner) => rewrite_tables(inner, old, new),
        // IN options are literals or a subquery with its own alias scope.
        Expr::In { value, .. } => rewrite_tables(value, old, new),
        Expr::Between {
            value,
            lower,
            upper,
        } => {
            rewrite_tables(value, old, new);
            rewrite_tables(lower, old, new);
            rewrite_tables(upper, old, new);
        }
        Expr::Like { value, pattern } => {
            rewrite_tables(value, old, new);
            rewrite_tables(pattern, old, new);
        }
        Expr::Function(f) => {
            for arg in &mut f.args {
                rewrite_tables(arg, old, new);
            }
            if let Some(filter) = &mut f.filter_where {
                rewrite_tables(filter, old, new);
            }
        }
        Expr::Coalesce { values, .. } => {
            for value in values {
                rewrite_tables(value, old, new);
            }
        }
        Expr::Subquery { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::BinaryOp;

    #[test]
    fn rewrite_changes_only_matching_tables() {
        let mut expr = Expr::binary(
            BinaryOp::Gt,
            Expr::qual_col("c", "age"),
            Expr::qual_col("u", "age"),
        );
        rewrite_tables(&mut expr, "c", "c0");
        match expr {
            Expr::Binary { left, right, .. } => {
                assert_eq!(
                    *left,
                    Expr::qual_col("c0", "age"),
                );
                assert_eq!(*right, Expr::qual_col("u", "age"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
