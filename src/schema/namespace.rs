//! Per-model namespace: fields, relations, DDL and row operations.
//!
//! A namespace owns everything the ORM knows about one table: the ordered
//! field descriptors, the declared relations, which versioning columns the
//! rows carry, and how to build the INSERT/UPDATE/DELETE statements for
//! them. Namespaces are constructed by the schema parser and frozen inside
//! the registry; at runtime they are shared immutably.

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pool::{Db, DbTransaction};
use crate::record::Record;
use crate::schema::declaration::ModelKind;
use crate::schema::field::{FieldDescriptor, LogicalType, Primitive};
use crate::schema::registry::Registry;
use crate::schema::relation::RelationInfo;
use crate::value::SqlValue;
use crate::versioning::{self, TurnStatus};

pub const TURN_ID_COLUMN: &str = "turn_id";
pub const BRANCH_ID_COLUMN: &str = "branch_id";
pub const ARTIFACT_ID_COLUMN: &str = "artifact_id";
pub const VERSION_COLUMN: &str = "version";
pub const DELETED_AT_COLUMN: &str = "deleted_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

#[derive(Debug, Clone)]
pub struct Namespace {
    model_name: String,
    table_name: String,
    kind: ModelKind,
    fields: IndexMap<String, FieldDescriptor>,
    relations: IndexMap<String, RelationInfo>,
    primary_key: Option<String>,
    default_temporal: Option<String>,
}

impl Namespace {
    pub fn new(model_name: impl Into<String>, table_name: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            model_name: model_name.into(),
            table_name: table_name.into(),
            kind,
            fields: IndexMap::new(),
            relations: IndexMap::new(),
            primary_key: None,
            default_temporal: None,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn is_versioned(&self) -> bool {
        matches!(self.kind, ModelKind::Versioned | ModelKind::Artifact)
    }

    pub fn is_artifact(&self) -> bool {
        self.kind == ModelKind::Artifact
    }

    /// Register a field. Enforces the single-primary-key and
    /// single-default-temporal invariants and rejects duplicate names.
    pub fn add_field(&mut self, field: FieldDescriptor) -> Result<()> {
        if self.fields.contains_key(&field.name) {
            return Err(Error::schema(format!(
                "duplicate field '{}' on model {}",
                field.name, self.model_name
            )));
        }
        if field.is_primary_key {
            if let Some(existing) = &self.primary_key {
                return Err(Error::schema(format!(
                    "model {} already has primary key '{}', cannot add '{}'",
                    self.model_name, existing, field.name
                )));
            }
            self.primary_key = Some(field.name.clone());
        }
        if field.is_default_temporal {
            if let Some(existing) = &self.default_temporal {
                return Err(Error::schema(format!(
                    "model {} already has default temporal field '{}', cannot add '{}'",
                    self.model_name, existing, field.name
                )));
            }
            self.default_temporal = Some(field.name.clone());
        }
        self.fields.insert(field.name.clone(), field);
        Ok(())
    }

    /// Register a relation. The local pivot column must already exist.
    pub fn add_relation(&mut self, relation: RelationInfo) -> Result<()> {
        if self.fields.contains_key(&relation.name) || self.relations.contains_key(&relation.name)
        {
            return Err(Error::schema(format!(
                "relation '{}' collides with an existing name on model {}",
                relation.name, self.model_name
            )));
        }
        if !self.fields.contains_key(&relation.primary_key) {
            return Err(Error::schema(format!(
                "relation '{}' pivots on unknown column '{}' of model {}",
                relation.name, relation.primary_key, self.model_name
            )));
        }
        self.relations.insert(relation.name.clone(), relation);
        Ok(())
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationInfo> {
        self.relations.values()
    }

    pub fn relation(&self, name: &str) -> Option<&RelationInfo> {
        self.relations.get(name)
    }

    /// Find the relation leading to a given foreign table, if declared.
    pub fn relation_to_table(&self, foreign_table: &str) -> Option<&RelationInfo> {
        self.relations
            .values()
            .find(|rel| rel.foreign_table == foreign_table)
    }

    pub fn primary_key(&self) -> Result<&FieldDescriptor> {
        self.primary_key
            .as_deref()
            .and_then(|name| self.fields.get(name))
            .ok_or_else(|| {
                Error::schema(format!("model {} has no primary key", self.model_name))
            })
    }

    pub fn default_temporal(&self) -> Option<&str> {
        self.default_temporal.as_deref()
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    pub fn create_table_sql(&self) -> String {
        let mut columns = Vec::with_capacity(self.fields.len());
        for field in self.fields.values() {
            let mut col = format!("\"{}\" {}", field.name, field.sql_type);
            if field.is_primary_key {
                col.push_str(" PRIMARY KEY");
            } else if !field.is_optional {
                col.push_str(" NOT NULL");
            }
            if let Some(default) = &field.default_expr {
                col.push_str(&format!(" DEFAULT {default}"));
            }
            columns.push(col);
        }
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n    {}\n);",
            self.table_name,
            columns.join(",\n    ")
        )
    }

    pub fn index_statements(&self) -> Vec<String> {
        self.fields
            .values()
            .filter_map(|field| {
                field.index.map(|kind| {
                    format!(
                        "CREATE INDEX IF NOT EXISTS \"{table}_{col}_idx\" ON \"{table}\" USING {method} (\"{col}\");",
                        table = self.table_name,
                        col = field.name,
                        method = kind.as_sql(),
                    )
                })
            })
            .collect()
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\" CASCADE;", self.table_name)
    }

    // ------------------------------------------------------------------
    // Statement builders
    // ------------------------------------------------------------------

    /// Build `INSERT … RETURNING *` for a record. Fields that serialize
    /// to NULL are omitted so column defaults (SERIAL, NOW()) apply.
    pub fn build_insert(&self, record: &Record) -> Result<(String, Vec<SqlValue>)> {
        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        let mut values = Vec::new();

        for field in self.fields.values() {
            let value = record.get(&field.name).cloned().unwrap_or(SqlValue::Null);
            let wire = field.serialize(value)?;
            if wire.is_null() {
                continue;
            }
            columns.push(format!("\"{}\"", field.name));
            placeholders.push(field.placeholder(values.len() + 1));
            values.push(wire);
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO \"{}\" DEFAULT VALUES RETURNING *", self.table_name)
        } else {
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({}) RETURNING *",
                self.table_name,
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        Ok((sql, values))
    }

    /// Build `UPDATE … WHERE pk = $N RETURNING *` for a record that
    /// carries its primary key.
    pub fn build_update(&self, record: &Record) -> Result<(String, Vec<SqlValue>)> {
        let pk = self.primary_key()?;
        let pk_value = record
            .get(&pk.name)
            .cloned()
            .filter(|v| !v.is_null())
            .ok_or_else(|| Error::bind(&pk.name, "update requires a primary key value"))?;

        let mut assignments = Vec::new();
        let mut values = Vec::new();
        for field in self.fields.values() {
            if field.is_primary_key {
                continue;
            }
            let Some(value) = record.get(&field.name).cloned() else {
                continue;
            };
            let wire = field.serialize(value)?;
            if wire.is_null() {
                // Inline NULL: an untyped NULL parameter would make the
                // backend infer the wrong column type.
                assignments.push(format!("\"{}\" = NULL", field.name));
                continue;
            }
            assignments.push(format!(
                "\"{}\" = {}",
                field.name,
                field.placeholder(values.len() + 1)
            ));
            values.push(wire);
        }
        if assignments.is_empty() {
            return Err(Error::bind(&pk.name, "update with no assignable fields"));
        }

        values.push(pk.serialize(pk_value)?);
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ${} RETURNING *",
            self.table_name,
            assignments.join(", "),
            pk.name,
            values.len()
        );
        Ok((sql, values))
    }

    // ------------------------------------------------------------------
    // Row decoding
    // ------------------------------------------------------------------

    /// Decode a fetched row into a record, running each column through its
    /// field descriptor. Unknown columns matching a relation name are kept
    /// as JSON (nested fetches); anything else is skipped.
    pub fn record_from_row(&self, row: &PgRow) -> Result<Record> {
        let mut record = Record::new();
        for column in row.columns() {
            let name = column.name();
            if let Some(field) = self.fields.get(name) {
                record.set(name.to_string(), self.decode_field(row, field)?);
            } else if self.relations.contains_key(name) {
                let value: Option<JsonValue> = row
                    .try_get(name)
                    .map_err(|e| Error::decode(name, e.to_string()))?;
                record.set(name.to_string(), value.map(SqlValue::Json).unwrap_or(SqlValue::Null));
            }
        }
        Ok(record)
    }

    fn decode_field(&self, row: &PgRow, field: &FieldDescriptor) -> Result<SqlValue> {
        let name = field.name.as_str();
        let decode_err = |e: sqlx::Error| Error::decode(name, e.to_string());
        let wire = match &field.logical {
            LogicalType::Integer => row
                .try_get::<Option<i32>, _>(name)
                .map_err(decode_err)?
                .map(|v| SqlValue::Int(v as i64)),
            LogicalType::Float => row
                .try_get::<Option<f64>, _>(name)
                .map_err(decode_err)?
                .map(SqlValue::Float),
            LogicalType::Text | LogicalType::Enum { .. } => row
                .try_get::<Option<String>, _>(name)
                .map_err(decode_err)?
                .map(SqlValue::Text),
            LogicalType::Bool => row
                .try_get::<Option<bool>, _>(name)
                .map_err(decode_err)?
                .map(SqlValue::Bool),
            LogicalType::Timestamp => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(name)
                .map_err(decode_err)?
                .map(SqlValue::Timestamp),
            LogicalType::Uuid => row
                .try_get::<Option<Uuid>, _>(name)
                .map_err(decode_err)?
                .map(SqlValue::Uuid),
            LogicalType::Json => row
                .try_get::<Option<JsonValue>, _>(name)
                .map_err(decode_err)?
                .map(SqlValue::Json),
            LogicalType::List(prim) => match prim {
                Primitive::Integer => row
                    .try_get::<Option<Vec<i32>>, _>(name)
                    .map_err(decode_err)?
                    .map(SqlValue::IntList),
                Primitive::Float => row
                    .try_get::<Option<Vec<f64>>, _>(name)
                    .map_err(decode_err)?
                    .map(SqlValue::FloatList),
                Primitive::Text => row
                    .try_get::<Option<Vec<String>>, _>(name)
                    .map_err(decode_err)?
                    .map(SqlValue::TextList),
                Primitive::Bool => row
                    .try_get::<Option<Vec<bool>>, _>(name)
                    .map_err(decode_err)?
                    .map(SqlValue::BoolList),
                Primitive::Uuid => row
                    .try_get::<Option<Vec<Uuid>>, _>(name)
                    .map_err(decode_err)?
                    .map(SqlValue::UuidList),
            },
        };
        field.deserialize(wire.unwrap_or(SqlValue::Null))
    }

    /// Decode one object out of a `jsonb_build_object` projection into a
    /// record, as produced by nested relation fetches.
    pub fn record_from_json(&self, object: &JsonValue) -> Result<Record> {
        let obj = object.as_object().ok_or_else(|| {
            Error::decode(&self.table_name, format!("expected json object, got {object}"))
        })?;
        let mut record = Record::new();
        for field in self.fields.values() {
            if let Some(value) = obj.get(&field.name) {
                record.set(field.name.clone(), field.from_json(value)?);
            }
        }
        for rel in self.relations.values() {
            if let Some(value) = obj.get(&rel.name) {
                record.set(rel.name.clone(), SqlValue::Json(value.clone()));
            }
        }
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Row operations
    // ------------------------------------------------------------------

    /// Point read by primary key. Bypasses version resolution — an id
    /// pins an exact physical row.
    pub async fn get(&self, db: &Db, id: SqlValue) -> Result<Option<Record>> {
        let pk = self.primary_key()?;
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" = $1",
            self.table_name, pk.name
        );
        let row = db.fetch_optional(&sql, vec![pk.serialize(id)?]).await?;
        row.map(|r| self.record_from_row(&r)).transpose()
    }

    /// Read an artifact by id: a specific version when given, otherwise
    /// the latest stored version.
    pub async fn get_artifact(
        &self,
        db: &Db,
        artifact_id: Uuid,
        version: Option<i32>,
    ) -> Result<Option<Record>> {
        if !self.is_artifact() {
            return Err(Error::schema(format!(
                "model {} is not an artifact",
                self.model_name
            )));
        }
        let (sql, params) = match version {
            Some(v) => (
                format!(
                    "SELECT * FROM \"{}\" WHERE \"{ARTIFACT_ID_COLUMN}\" = $1 AND \"{VERSION_COLUMN}\" = $2",
                    self.table_name
                ),
                vec![SqlValue::Uuid(artifact_id), SqlValue::Int(v as i64)],
            ),
            None => (
                format!(
                    "SELECT DISTINCT ON (\"{ARTIFACT_ID_COLUMN}\") * FROM \"{}\" WHERE \"{ARTIFACT_ID_COLUMN}\" = $1 \
                     ORDER BY \"{ARTIFACT_ID_COLUMN}\", \"{VERSION_COLUMN}\" DESC",
                    self.table_name
                ),
                vec![SqlValue::Uuid(artifact_id)],
            ),
        };
        let row = db.fetch_optional(&sql, params).await?;
        row.map(|r| self.record_from_row(&r)).transpose()
    }

    /// Save a record. Plain rows insert or update in place; versioned
    /// rows are stamped with the ambient turn/branch; artifact rows are
    /// never mutated — a re-save inserts the next version.
    pub async fn save(&self, db: &Db, mut record: Record) -> Result<Record> {
        self.fill_reverse_foreign_keys(&mut record)?;

        if self.is_versioned() {
            self.stamp_version_head(db, &mut record).await?;
        }

        let pk = self.primary_key()?;
        let has_pk = record.get(&pk.name).map(|v| !v.is_null()).unwrap_or(false);

        if self.is_artifact() {
            if !has_pk {
                if record
                    .get(ARTIFACT_ID_COLUMN)
                    .map(|v| v.is_null())
                    .unwrap_or(true)
                {
                    record.set(ARTIFACT_ID_COLUMN, SqlValue::Uuid(Uuid::new_v4()));
                }
                record.set(VERSION_COLUMN, SqlValue::Int(1));
                let (sql, params) = self.build_insert(&record)?;
                let row = db.fetch_one(&sql, params).await?;
                return self.record_from_row(&row);
            }
            return self.insert_next_version(db, record, false).await;
        }

        if has_pk {
            let (sql, params) = self.build_update(&record)?;
            let row = db.fetch_one(&sql, params).await?;
            self.record_from_row(&row)
        } else {
            let (sql, params) = self.build_insert(&record)?;
            let row = db.fetch_one(&sql, params).await?;
            self.record_from_row(&row)
        }
    }

    /// Delete a record. Artifacts tombstone; plain rows are removed.
    pub async fn delete_record(&self, db: &Db, mut record: Record) -> Result<()> {
        if self.is_artifact() {
            self.fill_reverse_foreign_keys(&mut record)?;
            self.stamp_version_head(db, &mut record).await?;
            self.insert_next_version(db, record, true).await?;
            return Ok(());
        }
        let pk = self.primary_key()?;
        let id = record
            .get(&pk.name)
            .cloned()
            .filter(|v| !v.is_null())
            .ok_or_else(|| Error::bind(&pk.name, "delete requires a primary key value"))?;
        let sql = format!(
            "DELETE FROM \"{}\" WHERE \"{}\" = $1",
            self.table_name, pk.name
        );
        db.execute(&sql, vec![pk.serialize(id)?]).await?;
        Ok(())
    }

    /// Insert-as-new-version: read the current max version for the
    /// artifact inside a transaction, then insert `max + 1`. The previous
    /// row is untouched.
    async fn insert_next_version(
        &self,
        db: &Db,
        mut record: Record,
        tombstone: bool,
    ) -> Result<Record> {
        let artifact_id = match record.get(ARTIFACT_ID_COLUMN) {
            Some(SqlValue::Uuid(id)) => *id,
            _ => {
                return Err(Error::bind(
                    ARTIFACT_ID_COLUMN,
                    "artifact re-save requires an artifact id",
                ))
            }
        };

        let pk = self.primary_key()?;
        record.take(&pk.name);
        record.set(UPDATED_AT_COLUMN, SqlValue::Timestamp(Utc::now().naive_utc()));
        if tombstone {
            record.set(DELETED_AT_COLUMN, SqlValue::Timestamp(Utc::now().naive_utc()));
        }

        let mut tx = db.begin().await?;
        let version = self.next_version(&mut tx, artifact_id).await?;
        record.set(VERSION_COLUMN, SqlValue::Int(version as i64));
        let (sql, params) = self.build_insert(&record)?;
        let row = tx.fetch_one(&sql, params).await?;
        let saved = self.record_from_row(&row)?;
        tx.commit().await?;
        debug!(
            table = %self.table_name,
            %artifact_id,
            version,
            tombstone,
            "inserted artifact version"
        );
        Ok(saved)
    }

    async fn next_version(&self, tx: &mut DbTransaction<'_>, artifact_id: Uuid) -> Result<i32> {
        let sql = format!(
            "SELECT COALESCE(MAX(\"{VERSION_COLUMN}\"), 0) AS current FROM \"{}\" WHERE \"{ARTIFACT_ID_COLUMN}\" = $1",
            self.table_name
        );
        let row = tx.fetch_one(&sql, vec![SqlValue::Uuid(artifact_id)]).await?;
        let current: i32 = row
            .try_get("current")
            .map_err(|e| Error::decode("current", e.to_string()))?;
        Ok(current + 1)
    }

    /// Resolve the ambient branch/turn for a versioned save and verify
    /// the turn is still staged.
    async fn stamp_version_head(&self, db: &Db, record: &mut Record) -> Result<()> {
        let branch_id = match record.get(BRANCH_ID_COLUMN) {
            Some(SqlValue::Int(id)) => *id as i32,
            _ => versioning::context::current_branch_id()
                .unwrap_or(versioning::ROOT_BRANCH_ID),
        };
        let turn_id = match record.get(TURN_ID_COLUMN) {
            Some(SqlValue::Int(id)) => *id as i32,
            _ => versioning::context::current_turn_id().ok_or_else(|| {
                Error::versioning(format!(
                    "versioned model {} cannot be saved without a turn",
                    self.model_name
                ))
            })?,
        };

        let turn = versioning::Turn::get(db, turn_id).await?;
        if turn.status != TurnStatus::Staged {
            return Err(Error::versioning(format!(
                "turn {turn_id} is {}, not staged",
                turn.status.as_str()
            )));
        }

        record.set(BRANCH_ID_COLUMN, SqlValue::Int(branch_id as i64));
        record.set(TURN_ID_COLUMN, SqlValue::Int(turn_id as i64));
        Ok(())
    }

    /// Fill null foreign keys from parents in the ambient context via the
    /// registry's reverse-relation index. A required foreign key with no
    /// parent in scope fails the save.
    fn fill_reverse_foreign_keys(&self, record: &mut Record) -> Result<()> {
        for field in self.fields.values() {
            if !field.is_foreign_key
                || field.name == TURN_ID_COLUMN
                || field.name == BRANCH_ID_COLUMN
            {
                continue;
            }
            let missing = record
                .get(&field.name)
                .map(|v| v.is_null())
                .unwrap_or(true);
            if !missing {
                continue;
            }
            let reverse = Registry::global().reverse_relation(&self.table_name, &field.name);
            let parent_value = reverse.as_ref().and_then(|rel| {
                versioning::context::parent_in_scope(&rel.table)
            });
            match parent_value {
                Some(value) => record.set(field.name.clone(), value),
                None if field.is_optional => {}
                None => {
                    return Err(Error::MissingForeignKey {
                        model: self.model_name.clone(),
                        field: field.name.clone(),
                    })
                }
            }
        }
        Ok(())
    }
}
