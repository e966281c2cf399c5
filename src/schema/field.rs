//! Per-column field descriptors.
//!
//! A descriptor carries the logical type of a column, the SQL type it maps
//! to, nullability, key flags and the serialize/deserialize pair that
//! moves values across the wire. Descriptors are built once by the schema
//! parser and are immutable afterwards.

use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::SqlValue;

/// Element type of a list column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Integer,
    Float,
    Text,
    Bool,
    Uuid,
}

impl Primitive {
    pub fn sql_type(self) -> &'static str {
        match self {
            Primitive::Integer => "INTEGER",
            Primitive::Float => "FLOAT",
            Primitive::Text => "TEXT",
            Primitive::Bool => "BOOLEAN",
            Primitive::Uuid => "UUID",
        }
    }
}

/// Logical column type. The wire representation for each variant is fixed:
/// enums travel as member strings, JSON payloads as text with a `::JSONB`
/// cast, lists as native arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalType {
    Integer,
    Float,
    Text,
    Bool,
    Timestamp,
    Uuid,
    Enum { members: Vec<String> },
    Json,
    List(Primitive),
}

/// Index shape for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Btree,
    Hash,
    Gin,
    Gist,
}

impl IndexKind {
    pub fn as_sql(self) -> &'static str {
        match self {
            IndexKind::Btree => "btree",
            IndexKind::Hash => "hash",
            IndexKind::Gin => "gin",
            IndexKind::Gist => "gist",
        }
    }
}

/// Column metadata plus the serialization pair.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub logical: LogicalType,
    pub sql_type: String,
    pub is_optional: bool,
    pub default_expr: Option<String>,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub referenced_table: Option<String>,
    pub is_default_temporal: bool,
    pub index: Option<IndexKind>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, logical: LogicalType) -> Self {
        let name = name.into();
        let sql_type = backend_type(&logical, false);
        Self {
            name,
            logical,
            sql_type,
            is_optional: false,
            default_expr: None,
            is_primary_key: false,
            is_foreign_key: false,
            referenced_table: None,
            is_default_temporal: false,
            index: None,
        }
    }

    /// Mark as primary key. Integer keys become `SERIAL`; UUID keys are
    /// auto-generated on insert when no value is supplied.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.sql_type = backend_type(&self.logical, true);
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default_expr = Some(expr.into());
        self
    }

    pub fn foreign_key(mut self, referenced_table: impl Into<String>) -> Self {
        self.is_foreign_key = true;
        self.referenced_table = Some(referenced_table.into());
        self
    }

    pub fn default_temporal(mut self) -> Self {
        self.is_default_temporal = true;
        if self.default_expr.is_none() {
            self.default_expr = Some("NOW()".to_string());
        }
        self
    }

    pub fn index(mut self, kind: IndexKind) -> Self {
        self.index = Some(kind);
        self
    }

    /// Placeholder for this field at position `idx`, with an explicit cast
    /// for the types the backend protocol cannot infer.
    pub fn placeholder(&self, idx: usize) -> String {
        match self.logical {
            LogicalType::Json => format!("${idx}::JSONB"),
            LogicalType::Timestamp => format!("${idx}::TIMESTAMP"),
            _ => format!("${idx}"),
        }
    }

    /// Check a value against the descriptor without converting it.
    pub fn validate(&self, value: &SqlValue) -> bool {
        if value.is_null() {
            return self.is_optional
                || self.default_expr.is_some()
                || self.is_primary_key
                || self.is_foreign_key;
        }
        match (&self.logical, value) {
            (LogicalType::Integer, SqlValue::Int(_)) => true,
            (LogicalType::Float, SqlValue::Float(_) | SqlValue::Int(_)) => true,
            (LogicalType::Text, SqlValue::Text(_)) => true,
            (LogicalType::Bool, SqlValue::Bool(_)) => true,
            (LogicalType::Timestamp, SqlValue::Timestamp(_)) => true,
            (LogicalType::Uuid, SqlValue::Uuid(_)) => true,
            (LogicalType::Uuid, SqlValue::Text(s)) => Uuid::parse_str(s).is_ok(),
            (LogicalType::Enum { members }, SqlValue::Text(s)) => members.contains(s),
            (LogicalType::Json, SqlValue::Json(_)) => true,
            (LogicalType::List(Primitive::Integer), SqlValue::IntList(_)) => true,
            (LogicalType::List(Primitive::Float), SqlValue::FloatList(_)) => true,
            (LogicalType::List(Primitive::Text), SqlValue::TextList(_)) => true,
            (LogicalType::List(Primitive::Bool), SqlValue::BoolList(_)) => true,
            (LogicalType::List(Primitive::Uuid), SqlValue::UuidList(_)) => true,
            _ => false,
        }
    }

    /// Normalize a logical value into its wire representation. Fails with
    /// a bind error when the value does not fit the column.
    pub fn serialize(&self, value: SqlValue) -> Result<SqlValue> {
        if value.is_null() {
            if self.is_primary_key && self.logical == LogicalType::Uuid {
                return Ok(SqlValue::Uuid(Uuid::new_v4()));
            }
            if self.is_optional
                || self.default_expr.is_some()
                || self.is_primary_key
                || self.is_foreign_key
            {
                return Ok(SqlValue::Null);
            }
            return Err(Error::bind(&self.name, "null value for required field"));
        }
        match (&self.logical, value) {
            (LogicalType::Uuid, SqlValue::Text(s)) => Uuid::parse_str(&s)
                .map(SqlValue::Uuid)
                .map_err(|e| Error::bind(&self.name, format!("invalid uuid: {e}"))),
            (LogicalType::Float, SqlValue::Int(i)) => Ok(SqlValue::Float(i as f64)),
            (logical, value) => {
                if self.validate(&value) {
                    Ok(value)
                } else {
                    Err(Error::bind(
                        &self.name,
                        format!("value {value:?} does not fit {logical:?}"),
                    ))
                }
            }
        }
    }

    /// Inverse of [`serialize`]: turn a stored wire value back into the
    /// logical representation.
    pub fn deserialize(&self, wire: SqlValue) -> Result<SqlValue> {
        if wire.is_null() {
            return Ok(SqlValue::Null);
        }
        match (&self.logical, wire) {
            (LogicalType::Uuid, SqlValue::Text(s)) => Uuid::parse_str(&s)
                .map(SqlValue::Uuid)
                .map_err(|e| Error::decode(&self.name, format!("invalid uuid: {e}"))),
            (LogicalType::Json, SqlValue::Text(s)) => serde_json::from_str(&s)
                .map(SqlValue::Json)
                .map_err(|e| Error::decode(&self.name, format!("malformed json: {e}"))),
            (LogicalType::Enum { members }, SqlValue::Text(s)) => {
                if members.contains(&s) {
                    Ok(SqlValue::Text(s))
                } else {
                    Err(Error::decode(
                        &self.name,
                        format!("'{s}' is not a member of the enum"),
                    ))
                }
            }
            (_, wire) => Ok(wire),
        }
    }

    /// Decode a value out of a `jsonb_build_object` projection, as emitted
    /// by nested relation fetches.
    pub fn from_json(&self, value: &JsonValue) -> Result<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        let mismatch =
            || Error::decode(&self.name, format!("json value {value} does not fit column"));
        match &self.logical {
            LogicalType::Integer => value.as_i64().map(SqlValue::Int).ok_or_else(mismatch),
            LogicalType::Float => value.as_f64().map(SqlValue::Float).ok_or_else(mismatch),
            LogicalType::Text => value
                .as_str()
                .map(|s| SqlValue::Text(s.to_string()))
                .ok_or_else(mismatch),
            LogicalType::Bool => value.as_bool().map(SqlValue::Bool).ok_or_else(mismatch),
            LogicalType::Timestamp => {
                let s = value.as_str().ok_or_else(mismatch)?;
                parse_json_timestamp(s)
                    .map(SqlValue::Timestamp)
                    .ok_or_else(|| Error::decode(&self.name, format!("invalid timestamp '{s}'")))
            }
            LogicalType::Uuid => {
                let s = value.as_str().ok_or_else(mismatch)?;
                Uuid::parse_str(s)
                    .map(SqlValue::Uuid)
                    .map_err(|e| Error::decode(&self.name, format!("invalid uuid: {e}")))
            }
            LogicalType::Enum { members } => {
                let s = value.as_str().ok_or_else(mismatch)?;
                if members.iter().any(|m| m == s) {
                    Ok(SqlValue::Text(s.to_string()))
                } else {
                    Err(Error::decode(
                        &self.name,
                        format!("'{s}' is not a member of the enum"),
                    ))
                }
            }
            LogicalType::Json => Ok(SqlValue::Json(value.clone())),
            LogicalType::List(prim) => {
                let items = value.as_array().ok_or_else(mismatch)?;
                match prim {
                    Primitive::Integer => items
                        .iter()
                        .map(|v| v.as_i64().map(|i| i as i32).ok_or_else(mismatch))
                        .collect::<Result<Vec<_>>>()
                        .map(SqlValue::IntList),
                    Primitive::Float => items
                        .iter()
                        .map(|v| v.as_f64().ok_or_else(mismatch))
                        .collect::<Result<Vec<_>>>()
                        .map(SqlValue::FloatList),
                    Primitive::Text => items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string).ok_or_else(mismatch))
                        .collect::<Result<Vec<_>>>()
                        .map(SqlValue::TextList),
                    Primitive::Bool => items
                        .iter()
                        .map(|v| v.as_bool().ok_or_else(mismatch))
                        .collect::<Result<Vec<_>>>()
                        .map(SqlValue::BoolList),
                    Primitive::Uuid => items
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .and_then(|s| Uuid::parse_str(s).ok())
                                .ok_or_else(mismatch)
                        })
                        .collect::<Result<Vec<_>>>()
                        .map(SqlValue::UuidList),
                }
            }
        }
    }
}

/// Map a logical type to the SQL column type.
fn backend_type(logical: &LogicalType, primary_key: bool) -> String {
    match logical {
        LogicalType::Integer if primary_key => "SERIAL".to_string(),
        LogicalType::Integer => "INTEGER".to_string(),
        LogicalType::Float => "FLOAT".to_string(),
        LogicalType::Text => "TEXT".to_string(),
        LogicalType::Bool => "BOOLEAN".to_string(),
        LogicalType::Timestamp => "TIMESTAMP".to_string(),
        LogicalType::Uuid => "UUID".to_string(),
        // Enum members are enforced by validate/deserialize; storage is
        // plain text so decoding never depends on backend type OIDs.
        LogicalType::Enum { .. } => "TEXT".to_string(),
        LogicalType::Json => "JSONB".to_string(),
        LogicalType::List(prim) => format!("{}[]", prim.sql_type()),
    }
}

/// Parse a timestamp as PostgreSQL renders it inside `jsonb_build_object`.
fn parse_json_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}
