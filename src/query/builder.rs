//! Fluent SELECT builder.
//!
//! A query set is a lazily compiled description of one SELECT over a
//! model. Every method consumes the set and returns a new one; joined
//! child sets become nested JSON projections. Versioned models get the
//! branch-visibility CTE attached up front, so the rest of the chain
//! composes against an already-scoped query.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::Db;
use crate::query::nested::{rewrite_tables, NestedSelect};
use crate::schema::declaration::Model;
use crate::schema::field::LogicalType;
use crate::schema::namespace::{Namespace, ARTIFACT_ID_COLUMN, DELETED_AT_COLUMN, TURN_ID_COLUMN, VERSION_COLUMN};
use crate::sql::ast::{
    ColumnRef, CteBody, Direction, Distinct, Expr, FromItem, JoinKind, Literal, OrderBy,
    SelectQuery, TableRef,
};
use crate::sql::compiler::{Compiled, Compiler};
use crate::value::SqlValue;
use crate::versioning::{self, context, TurnStatus};

/// Allocates short, unique table aliases: first letter of the table name,
/// then numbered fallbacks on collision.
#[derive(Debug, Clone, Default)]
pub(crate) struct AliasAllocator {
    used: HashSet<String>,
}

impl AliasAllocator {
    pub fn allocate(&mut self, table_name: &str) -> String {
        let base: String = table_name
            .chars()
            .next()
            .map(|c| c.to_ascii_lowercase().to_string())
            .unwrap_or_else(|| "t".to_string());
        let mut alias = base.clone();
        let mut i = 0;
        while self.used.contains(&alias) {
            alias = format!("{base}{i}");
            i += 1;
        }
        self.used.insert(alias.clone());
        alias
    }
}

/// Column proxy handed to `filter` closures.
pub struct Cols {
    table: String,
}

impl Cols {
    pub fn col(&self, name: &str) -> ColExpr {
        ColExpr {
            col: ColumnRef::qualified(name, &self.table),
        }
    }
}

/// One column under comparison; each method yields a finished [`Expr`].
pub struct ColExpr {
    col: ColumnRef,
}

impl ColExpr {
    fn compare(self, build: impl FnOnce(Expr, Expr) -> Expr, value: impl Into<SqlValue>) -> Expr {
        build(Expr::Column(self.col), Expr::param(value))
    }

    pub fn eq(self, value: impl Into<SqlValue>) -> Expr {
        self.compare(Expr::eq, value)
    }

    pub fn ne(self, value: impl Into<SqlValue>) -> Expr {
        self.compare(Expr::ne, value)
    }

    pub fn gt(self, value: impl Into<SqlValue>) -> Expr {
        self.compare(Expr::gt, value)
    }

    pub fn gte(self, value: impl Into<SqlValue>) -> Expr {
        self.compare(Expr::gte, value)
    }

    pub fn lt(self, value: impl Into<SqlValue>) -> Expr {
        self.compare(Expr::lt, value)
    }

    pub fn lte(self, value: impl Into<SqlValue>) -> Expr {
        self.compare(Expr::lte, value)
    }

    pub fn like(self, pattern: impl Into<String>) -> Expr {
        Expr::like(Expr::Column(self.col), Expr::param(pattern.into()))
    }

    pub fn is_null(self) -> Expr {
        Expr::is_null(Expr::Column(self.col))
    }

    pub fn not_null(self) -> Expr {
        !Expr::is_null(Expr::Column(self.col))
    }

    pub fn in_list<V: Into<SqlValue>>(self, values: impl IntoIterator<Item = V>) -> Expr {
        Expr::in_values(
            Expr::Column(self.col),
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn between(self, lower: impl Into<SqlValue>, upper: impl Into<SqlValue>) -> Expr {
        Expr::between(
            Expr::Column(self.col),
            Expr::param(lower),
            Expr::param(upper),
        )
    }

    /// The bare column, for comparisons against other expressions.
    pub fn expr(self) -> Expr {
        Expr::Column(self.col)
    }
}

/// A composable, lazily compiled SELECT over model `M`.
pub struct SelectSet<M: Model> {
    pub(crate) ns: Arc<Namespace>,
    pub(crate) table: TableRef,
    pub(crate) query: SelectQuery,
    pub(crate) selected: Vec<String>,
    pub(crate) orderings: Vec<(String, Direction)>,
    pub(crate) nested: Vec<NestedSelect>,
    pub(crate) aliases: AliasAllocator,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Model> std::fmt::Debug for SelectSet<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectSet")
            .field("ns", &self.ns)
            .field("table", &self.table)
            .field("query", &self.query)
            .field("selected", &self.selected)
            .field("orderings", &self.orderings)
            .field("nested", &self.nested)
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl<M: Model> SelectSet<M> {
    /// A bare set over the namespace, selecting all columns, with no
    /// visibility machinery.
    pub fn unscoped(ns: Arc<Namespace>) -> Self {
        let mut aliases = AliasAllocator::default();
        let alias = aliases.allocate(ns.table_name());
        let table = TableRef::aliased(ns.table_name(), alias);
        let query = SelectQuery::from_table(table.clone());
        let set = Self {
            ns,
            table,
            query,
            selected: Vec::new(),
            orderings: Vec::new(),
            nested: Vec::new(),
            aliases,
            _marker: PhantomData,
        };
        set.select(&["*"])
    }

    /// Query scoped to the branch in the ambient context, or the root
    /// branch when none is set.
    pub fn for_model() -> Result<Self> {
        let branch_id = context::current_branch_id().unwrap_or(versioning::ROOT_BRANCH_ID);
        Self::for_model_at(branch_id)
    }

    /// Query pinned to an explicit branch head.
    pub fn for_model_at(branch_id: i32) -> Result<Self> {
        Self::scoped(branch_id, None)
    }

    /// Query pinned to a branch as of a specific turn index, rather than
    /// its current head.
    pub fn for_model_at_turn(branch_id: i32, turn_index: i32) -> Result<Self> {
        Self::scoped(branch_id, Some(turn_index))
    }

    fn scoped(branch_id: i32, head_index: Option<i32>) -> Result<Self> {
        let ns = M::namespace()?;
        if !ns.is_versioned() {
            return Ok(Self::unscoped(ns));
        }
        if ns.is_artifact() {
            Self::artifact_scoped(ns, branch_id, head_index)
        } else {
            Ok(Self::version_scoped(ns, branch_id, head_index))
        }
    }

    /// Versioned (non-artifact) scope: join the committed-turn CTE.
    fn version_scoped(ns: Arc<Namespace>, branch_id: i32, head_index: Option<i32>) -> Self {
        Self::unscoped(ns)
            .with_cte(
                "turn_hierarchy",
                CteBody::Select(versioning::visible_turns_query(
                    branch_id,
                    head_index,
                    TurnStatus::Committed,
                    None,
                )),
                false,
            )
            .join_cte("turn_hierarchy", TURN_ID_COLUMN, "id", "th", JoinKind::Inner)
    }

    /// Artifact scope: latest visible version per artifact, tombstones
    /// filtered, wrapped as a subquery so further chaining applies to the
    /// resolved rows.
    fn artifact_scoped(ns: Arc<Namespace>, branch_id: i32, head_index: Option<i32>) -> Result<Self> {
        let mut inner = Self::version_scoped(Arc::clone(&ns), branch_id, head_index);
        let inner_ref = inner.table.reference().to_string();
        inner.query.distinct = Distinct::On(vec![Expr::qual_col(
            inner_ref.clone(),
            ARTIFACT_ID_COLUMN,
        )]);
        inner.query.order_by = vec![
            OrderBy::desc(Expr::qual_col(inner_ref.clone(), ARTIFACT_ID_COLUMN)),
            OrderBy::desc(Expr::qual_col(inner_ref.clone(), VERSION_COLUMN)),
        ];

        let alias = inner_ref;
        let aliases = inner.aliases.clone();
        let mut outer_query =
            SelectQuery::from_subquery(inner.build_query()?, alias.clone());
        outer_query.add_where(Expr::is_null(Expr::qual_col(
            alias.clone(),
            DELETED_AT_COLUMN,
        )));

        let outer = Self {
            ns,
            table: TableRef::new(alias),
            query: outer_query,
            selected: Vec::new(),
            orderings: Vec::new(),
            nested: Vec::new(),
            aliases,
            _marker: PhantomData,
        };
        Ok(outer.select(&["*"]))
    }

    /// Select columns. `"*"` expands to every column of the model.
    pub fn select(mut self, fields: &[&str]) -> Self {
        self.selected = if fields == ["*"] {
            self.ns.fields().map(|f| f.name.clone()).collect()
        } else {
            fields.iter().map(|f| f.to_string()).collect()
        };
        let table = self.table.reference().to_string();
        self.query.columns = self
            .selected
            .iter()
            .map(|name| Expr::qual_col(table.clone(), name))
            .collect();
        self
    }

    /// Keyword-equality filter, conjoined with any existing WHERE.
    pub fn where_eq(mut self, field: &str, value: impl Into<SqlValue>) -> Self {
        let cast = self.ns.field(field).and_then(|f| match f.logical {
            LogicalType::Json => Some("JSONB".to_string()),
            LogicalType::Timestamp => Some("TIMESTAMP".to_string()),
            _ => None,
        });
        let literal = Expr::Value(Literal {
            value: value.into(),
            inline: false,
            cast,
        });
        let condition = Expr::eq(
            Expr::qual_col(self.table.reference().to_string(), field),
            literal,
        );
        self.query.add_where(condition);
        self
    }

    /// Predicate filter: the closure receives a column proxy and returns
    /// an expression; composed with `&`, `|` and `!`.
    pub fn filter(mut self, predicate: impl FnOnce(&Cols) -> Expr) -> Self {
        let cols = Cols {
            table: self.table.reference().to_string(),
        };
        let condition = predicate(&cols);
        self.query.add_where(condition);
        self
    }

    /// Order by fields; a `-` prefix means descending.
    pub fn order_by(mut self, fields: &[&str]) -> Self {
        let table = self.table.reference().to_string();
        for field in fields {
            let (name, direction) = match field.strip_prefix('-') {
                Some(name) => (name, Direction::Desc),
                None => (*field, Direction::Asc),
            };
            self.orderings.push((name.to_string(), direction));
            self.query.order_by.push(OrderBy {
                expr: Expr::qual_col(table.clone(), name),
                direction,
            });
        }
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.query.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: i64) -> Self {
        self.query.offset = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.query.distinct = Distinct::All;
        self
    }

    pub fn distinct_on(mut self, field: &str) -> Self {
        let column = Expr::qual_col(self.table.reference().to_string(), field);
        self.query.distinct = Distinct::On(vec![column]);
        self
    }

    /// Prepend a CTE to the query.
    pub fn with_cte(mut self, name: &str, body: CteBody, recursive: bool) -> Self {
        self.query.prepend_cte(name, body, recursive);
        self
    }

    /// Join a named CTE on `local_col = alias.cte_col`.
    pub fn join_cte(
        mut self,
        name: &str,
        local_col: &str,
        cte_col: &str,
        alias: &str,
        kind: JoinKind,
    ) -> Self {
        let condition = Expr::eq(
            Expr::qual_col(self.table.reference().to_string(), local_col),
            Expr::qual_col(alias, cte_col),
        );
        self.query.add_join(
            FromItem::Table(TableRef::aliased(name, alias)),
            condition,
            kind,
        );
        self
    }

    /// Attach a child query set as a nested JSON projection. The relation
    /// from this model to the child's model must be declared.
    pub fn join<C: Model>(mut self, child: SelectSet<C>) -> Result<Self> {
        let rel = self
            .ns
            .relation_to_table(child.ns.table_name())
            .cloned()
            .ok_or_else(|| {
                Error::schema(format!(
                    "no relation from {} to {}",
                    self.ns.model_name(),
                    child.ns.model_name()
                ))
            })?;
        let nested = child.into_nested(rel, &mut self.aliases);
        self.nested.push(nested);
        Ok(self)
    }

    /// Single-row adapter: ascending primary-key order, limit 1.
    pub fn first(self) -> Result<SingleRow<M>> {
        let pk = self.ns.primary_key()?.name.clone();
        Ok(SingleRow {
            set: self.order_by(&[pk.as_str()]).limit(1),
        })
    }

    /// Single-row adapter: descending primary-key order, limit 1.
    pub fn last(self) -> Result<SingleRow<M>> {
        let pk = format!("-{}", self.ns.primary_key()?.name);
        Ok(SingleRow {
            set: self.order_by(&[pk.as_str()]).limit(1),
        })
    }

    /// Fold the nested projections into the final AST.
    pub(crate) fn build_query(&self) -> Result<SelectQuery> {
        let mut query = self.query.clone();
        if !self.nested.is_empty() {
            let parent_ref = self.table.reference().to_string();
            for nested in &self.nested {
                nested.attach(&mut query, &parent_ref)?;
            }
            if query.group_by.is_empty() {
                let pk = self.ns.primary_key()?.name.clone();
                query.group_by = vec![Expr::qual_col(parent_ref, pk)];
            }
        }
        Ok(query)
    }

    /// Render to SQL text plus bound parameters.
    pub fn compile(&self) -> Result<Compiled> {
        Compiler::new().compile(&self.build_query()?)
    }

    pub async fn fetch_all(self, db: &Db) -> Result<Vec<M>> {
        let compiled = self.compile()?;
        let rows = db.fetch_all(&compiled.sql, compiled.params).await?;
        rows.iter()
            .map(|row| M::from_record(self.ns.record_from_row(row)?))
            .collect()
    }

    pub async fn fetch_optional(self, db: &Db) -> Result<Option<M>> {
        let compiled = self.compile()?;
        let row = db.fetch_optional(&compiled.sql, compiled.params).await?;
        row.map(|r| M::from_record(self.ns.record_from_row(&r)?))
            .transpose()
    }

    pub async fn fetch_one(self, db: &Db) -> Result<M> {
        let model_name = self.ns.model_name().to_string();
        self.fetch_optional(db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no {model_name} row matched the query")))
    }

    /// Convert this set into a nested projection under a parent.
    fn into_nested(self, rel: crate::schema::relation::RelationInfo, allocator: &mut AliasAllocator) -> NestedSelect {
        let old_alias = self.table.reference().to_string();
        let new_alias = allocator.allocate(self.ns.table_name());
        let junction_alias = rel.junction().map(|(table, _, _)| allocator.allocate(table));

        let mut where_extra = self.query.where_clause.clone();
        if let Some(expr) = &mut where_extra {
            rewrite_tables(expr, &old_alias, &new_alias);
        }

        let mut nested = self.nested;
        for grandchild in &mut nested {
            grandchild.realias(allocator);
        }

        NestedSelect {
            rel,
            ns: self.ns,
            alias: new_alias,
            junction_alias,
            columns: self.selected,
            where_extra,
            order_by: self.orderings,
            nested,
        }
    }
}

impl NestedSelect {
    /// Re-allocate this projection's aliases (and its descendants') in the
    /// parent's allocator, rewriting captured predicates.
    pub(crate) fn realias(&mut self, allocator: &mut AliasAllocator) {
        let old = self.alias.clone();
        self.alias = allocator.allocate(&self.rel.foreign_table);
        if let Some(expr) = &mut self.where_extra {
            rewrite_tables(expr, &old, &self.alias);
        }
        if let Some((junction_table, _, _)) = self.rel.junction() {
            let junction_table = junction_table.to_string();
            self.junction_alias = Some(allocator.allocate(&junction_table));
        }
        for child in &mut self.nested {
            child.realias(allocator);
        }
    }
}

/// Wraps a query set pinned to one row; yields `None` on empty.
pub struct SingleRow<M: Model> {
    set: SelectSet<M>,
}

impl<M: Model> SingleRow<M> {
    pub fn compile(&self) -> Result<Compiled> {
        self.set.compile()
    }

    pub async fn fetch(self, db: &Db) -> Result<Option<M>> {
        self.set.fetch_optional(db).await
    }
}
