//! Declarative model descriptions.
//!
//! A model describes itself once — name, table, versioning kind, fields
//! and relations — and the schema parser turns that description into a
//! registered namespace. There is no reflection: the declaration is the
//! single source of schema truth.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::Db;
use crate::query::builder::SelectSet;
use crate::record::Record;
use crate::schema::field::{IndexKind, LogicalType};
use crate::schema::namespace::Namespace;
use crate::schema::registry::Registry;
use crate::schema::relation::ReferentialAction;
use crate::value::SqlValue;

/// How rows of a model participate in version control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelKind {
    /// Plain rows, no version columns.
    #[default]
    Plain,
    /// Rows carry `turn_id` + `branch_id` and are resolved through the
    /// branch hierarchy on read.
    Versioned,
    /// Versioned rows that additionally carry `(artifact_id, version)`;
    /// updates insert new versions, deletes insert tombstones.
    Artifact,
}

/// One declared column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub logical: LogicalType,
    pub optional: bool,
    pub primary_key: bool,
    pub foreign_key: Option<String>,
    pub default_expr: Option<String>,
    pub default_temporal: bool,
    pub index: Option<IndexKind>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, logical: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical,
            optional: false,
            primary_key: false,
            foreign_key: None,
            default_expr: None,
            default_temporal: false,
            index: None,
        }
    }

    /// Integer primary key; emitted as `SERIAL`.
    pub fn serial_key(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Integer).primary_key()
    }

    /// UUID primary key; auto-generated on insert when missing.
    pub fn uuid_key(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Uuid).primary_key()
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Foreign key referencing `table(id)`.
    pub fn foreign_key(mut self, table: impl Into<String>) -> Self {
        self.foreign_key = Some(table.into());
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default_expr = Some(expr.into());
        self
    }

    /// Mark as the created-at column. At most one per model.
    pub fn default_temporal(mut self) -> Self {
        self.default_temporal = true;
        self
    }

    pub fn index(mut self, kind: IndexKind) -> Self {
        self.index = Some(kind);
        self
    }
}

/// One declared relation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDecl {
    pub name: String,
    pub foreign_model: String,
    pub foreign_table: String,
    /// Column on the declaring side; defaults to its primary key.
    pub primary_key: Option<String>,
    /// Column on the foreign side (or, for many-to-many, the foreign
    /// side's primary key reached through the junction).
    pub foreign_key: String,
    pub one_to_one: bool,
    pub junction: Option<(String, (String, String))>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl RelationDecl {
    fn new(
        name: impl Into<String>,
        foreign_model: impl Into<String>,
        foreign_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            foreign_model: foreign_model.into(),
            foreign_table: foreign_table.into(),
            primary_key: None,
            foreign_key: foreign_key.into(),
            one_to_one: false,
            junction: None,
            on_delete: ReferentialAction::Cascade,
            on_update: ReferentialAction::Cascade,
        }
    }

    pub fn one_to_many(
        name: impl Into<String>,
        foreign_model: impl Into<String>,
        foreign_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, foreign_model, foreign_table, foreign_key)
    }

    pub fn one_to_one(
        name: impl Into<String>,
        foreign_model: impl Into<String>,
        foreign_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let mut decl = Self::new(name, foreign_model, foreign_table, foreign_key);
        decl.one_to_one = true;
        decl
    }

    /// Many-to-many through an explicit junction table.
    /// `junction_keys` is `(column referencing this side, column
    /// referencing the foreign side)`.
    pub fn many_to_many(
        name: impl Into<String>,
        foreign_model: impl Into<String>,
        foreign_table: impl Into<String>,
        junction_table: impl Into<String>,
        junction_keys: (impl Into<String>, impl Into<String>),
    ) -> Self {
        let mut decl = Self::new(name, foreign_model, foreign_table, "id");
        decl.junction = Some((
            junction_table.into(),
            (junction_keys.0.into(), junction_keys.1.into()),
        ));
        decl
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }
}

/// A complete model description.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDeclaration {
    pub model_name: String,
    pub table_name: String,
    pub kind: ModelKind,
    pub fields: Vec<FieldDecl>,
    pub relations: Vec<RelationDecl>,
}

impl ModelDeclaration {
    pub fn new(model_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            table_name: table_name.into(),
            kind: ModelKind::Plain,
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn versioned(mut self) -> Self {
        self.kind = ModelKind::Versioned;
        self
    }

    pub fn artifact(mut self) -> Self {
        self.kind = ModelKind::Artifact;
        self
    }

    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationDecl) -> Self {
        self.relations.push(relation);
        self
    }
}

/// A persistent model. Implementations describe their schema once and
/// convert themselves to and from [`Record`]s; everything else — DDL,
/// statements, version resolution — is derived.
#[allow(async_fn_in_trait)]
pub trait Model: Sized + Send + Sync + 'static {
    const MODEL_NAME: &'static str;

    fn declaration() -> ModelDeclaration;

    fn to_record(&self) -> Record;

    fn from_record(record: Record) -> Result<Self>;

    /// The registered namespace for this model.
    fn namespace() -> Result<Arc<Namespace>> {
        Registry::global().namespace(Self::MODEL_NAME)
    }

    /// Start a SELECT over this model. For versioned models the query is
    /// scoped to the branch in the ambient context (or the root branch)
    /// and sees committed turns only.
    fn query() -> Result<SelectSet<Self>> {
        SelectSet::for_model()
    }

    /// Start a SELECT pinned to an explicit branch.
    fn query_at(branch_id: i32) -> Result<SelectSet<Self>> {
        SelectSet::for_model_at(branch_id)
    }

    /// Start a SELECT pinned to a branch as of a turn index, rather than
    /// the branch head. `fork(b, k)` followed by a read of the new branch
    /// sees exactly what `query_at_turn(b, k)` sees.
    fn query_at_turn(branch_id: i32, turn_index: i32) -> Result<SelectSet<Self>> {
        SelectSet::for_model_at_turn(branch_id, turn_index)
    }

    /// Insert or version-bump this instance, returning the stored row.
    async fn save(&self, db: &Db) -> Result<Self> {
        let ns = Self::namespace()?;
        let record = ns.save(db, self.to_record()).await?;
        Self::from_record(record)
    }

    /// Fetch by primary key; `NotFound` when no row matches.
    async fn get(db: &Db, id: impl Into<SqlValue>) -> Result<Self> {
        let ns = Self::namespace()?;
        let id = id.into();
        match ns.get(db, id.clone()).await? {
            Some(record) => Self::from_record(record),
            None => Err(Error::NotFound(format!(
                "{} with id {id:?}",
                Self::MODEL_NAME
            ))),
        }
    }

    async fn get_or_none(db: &Db, id: impl Into<SqlValue>) -> Result<Option<Self>> {
        let ns = Self::namespace()?;
        match ns.get(db, id.into()).await? {
            Some(record) => Self::from_record(record).map(Some),
            None => Ok(None),
        }
    }

    /// Point read of an artifact: the exact version when given, otherwise
    /// the latest stored version. Artifact models only.
    async fn get_artifact(
        db: &Db,
        artifact_id: uuid::Uuid,
        version: Option<i32>,
    ) -> Result<Self> {
        let ns = Self::namespace()?;
        match ns.get_artifact(db, artifact_id, version).await? {
            Some(record) => Self::from_record(record),
            None => Err(Error::NotFound(format!(
                "{} artifact {artifact_id} version {version:?}",
                Self::MODEL_NAME
            ))),
        }
    }

    /// Delete this instance. Artifact models tombstone (insert a new
    /// version with `deleted_at` set); plain models delete the row.
    async fn delete(&self, db: &Db) -> Result<()> {
        let ns = Self::namespace()?;
        ns.delete_record(db, self.to_record()).await
    }

    /// Attach and save a child through the declared relation; for
    /// many-to-many this also inserts the junction row.
    async fn add<C: Model>(&self, db: &Db, child: C) -> Result<C> {
        crate::schema::relation::add_related(db, self, child).await
    }

    /// Query this instance's children through the declared relation.
    fn related<C: Model>(&self) -> Result<SelectSet<C>> {
        crate::schema::relation::related_query(self)
    }
}

/// Decode a nested relation column out of a fetched record: the JSON
/// array a joined child set was aggregated into becomes model instances.
/// Missing or NULL columns decode to an empty collection.
pub fn decode_children<C: Model>(record: &mut Record, relation: &str) -> Result<Vec<C>> {
    let ns = C::namespace()?;
    record
        .take_json_array(relation)?
        .iter()
        .map(|item| C::from_record(ns.record_from_json(item)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_builder_accumulates() {
        let decl = ModelDeclaration::new("Post", "posts")
            .versioned()
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("title", LogicalType::Text))
            .relation(RelationDecl::one_to_many(
                "comments", "Comment", "comments", "post_id",
            ));
        assert_eq!(decl.kind, ModelKind::Versioned);
        assert_eq!(decl.fields.len(), 2);
        assert_eq!(decl.relations.len(), 1);
    }

    #[test]
    fn many_to_many_carries_junction() {
        let decl = RelationDecl::many_to_many(
            "comments",
            "Comment",
            "comments",
            "user_comment_rel",
            ("user_id", "comment_id"),
        );
        let (table, keys) = decl.junction.unwrap();
        assert_eq!(table, "user_comment_rel");
        assert_eq!(keys, ("user_id".to_string(), "comment_id".to_string()));
    }
}
