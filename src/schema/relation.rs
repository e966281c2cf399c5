//! Relation metadata and resolution.
//!
//! Relations live on the namespace, not on model instances: a parent does
//! not own child rows, it only knows how to reach them. One-to-one and
//! one-to-many relations are a foreign-key column on the far side;
//! many-to-many relations route through an explicit junction table.

use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::Db;
use crate::query::builder::SelectSet;
use crate::record::Record;
use crate::schema::declaration::Model;
use crate::schema::registry::Registry;
use crate::sql::ast::{Expr, InList, SelectQuery, TableRef};
use crate::value::SqlValue;
use crate::versioning::context;

/// Referential action for FK constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    NoAction,
}

impl ReferentialAction {
    pub fn as_sql(self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToMany {
        junction_table: String,
        /// (column referencing the owning side, column referencing the
        /// foreign side) on the junction table.
        junction_keys: (String, String),
    },
}

/// One declared relation, as seen from the owning namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub name: String,
    /// Table of the owning (primary) side.
    pub table: String,
    /// Column on the owning side the relation pivots on.
    pub primary_key: String,
    /// Table of the foreign side.
    pub foreign_table: String,
    /// Column on the foreign side referring back to `primary_key`.
    pub foreign_key: String,
    /// Model name of the foreign side, for registry lookups.
    pub foreign_model: String,
    pub kind: RelationKind,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl RelationInfo {
    pub fn is_many_to_many(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToMany { .. })
    }

    /// The junction table and key pair, when this is a many-to-many
    /// relation.
    pub fn junction(&self) -> Option<(&str, &str, &str)> {
        match &self.kind {
            RelationKind::ManyToMany {
                junction_table,
                junction_keys: (local, other),
            } => Some((junction_table.as_str(), local.as_str(), other.as_str())),
            _ => None,
        }
    }
}

fn relation_between<P: Model, C: Model>() -> Result<RelationInfo> {
    let parent_ns = P::namespace()?;
    let child_ns = C::namespace()?;
    parent_ns
        .relation_to_table(child_ns.table_name())
        .cloned()
        .ok_or_else(|| {
            Error::schema(format!(
                "no relation from {} to {}",
                P::MODEL_NAME,
                C::MODEL_NAME
            ))
        })
}

fn pivot_value<P: Model>(parent: &P, rel: &RelationInfo) -> Result<SqlValue> {
    parent
        .to_record()
        .get(&rel.primary_key)
        .cloned()
        .filter(|v| !v.is_null())
        .ok_or_else(|| {
            Error::bind(
                rel.primary_key.clone(),
                "parent must be saved before its relations are used",
            )
        })
}

/// Attach `child` to `parent` through the declared relation and save it.
///
/// One-to-one and one-to-many save the child inside a context scope that
/// carries the parent, so the child's foreign key is filled by the
/// reverse-relation lookup. Many-to-many saves the child first, then
/// inserts one junction row pairing the two primary keys.
pub async fn add_related<P: Model, C: Model>(db: &Db, parent: &P, child: C) -> Result<C> {
    let rel = relation_between::<P, C>()?;
    let child_ns = C::namespace()?;

    match rel.junction() {
        None => {
            let scope = context::scoped_to(parent)?;
            let saved = scope.scope(child_ns.save(db, child.to_record())).await?;
            C::from_record(saved)
        }
        Some((junction_table, local_key, other_key)) => {
            let parent_key = pivot_value(parent, &rel)?;
            let junction_ns = Registry::global()
                .namespace_by_table(junction_table)
                .ok_or_else(|| {
                    Error::schema(format!("junction table '{junction_table}' is not registered"))
                })?;

            let saved = child_ns.save(db, child.to_record()).await?;
            let child_key = saved
                .get(&child_ns.primary_key()?.name)
                .cloned()
                .filter(|v| !v.is_null())
                .ok_or_else(|| Error::bind(other_key, "saved child has no primary key"))?;

            let junction_row = Record::new()
                .with(local_key, parent_key)
                .with(other_key, child_key);
            junction_ns.save(db, junction_row).await?;
            debug!(
                parent = P::MODEL_NAME,
                child = C::MODEL_NAME,
                junction = junction_table,
                "linked many-to-many pair"
            );
            C::from_record(saved)
        }
    }
}

/// Query the children of `parent` through the declared relation, ordered
/// by the child's created-at column when it has one.
pub fn related_query<P: Model, C: Model>(parent: &P) -> Result<SelectSet<C>> {
    let rel = relation_between::<P, C>()?;
    let parent_key = pivot_value(parent, &rel)?;
    let child_ns = C::namespace()?;

    let mut set = match rel.junction() {
        None => C::query()?.where_eq(&rel.foreign_key, parent_key),
        Some((junction_table, local_key, other_key)) => {
            let child_pk = child_ns.primary_key()?.name.clone();
            let mut membership = SelectQuery::from_table(TableRef::new(junction_table));
            membership.columns = vec![Expr::col(other_key)];
            membership.add_where(Expr::eq(Expr::col(local_key), Expr::param(parent_key)));

            C::query()?.filter(move |cols| Expr::In {
                value: Box::new(cols.col(&child_pk).expr()),
                options: InList::Subquery(Box::new(membership)),
            })
        }
    };
    if let Some(created) = child_ns.default_temporal() {
        let created = created.to_string();
        set = set.order_by(&[created.as_str()]);
    }
    Ok(set)
}
