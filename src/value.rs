//! Wire value sum type.
//!
//! Every value that crosses the statement boundary is one of these
//! variants. Logical values (enum members, JSON payloads, UUIDs) are
//! normalized into this representation by the field descriptors before a
//! statement is built, and back out of it after rows are fetched.

use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use uuid::Uuid;

/// A single bindable SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
    Json(JsonValue),
    IntList(Vec<i32>),
    FloatList(Vec<f64>),
    TextList(Vec<String>),
    BoolList(Vec<bool>),
    UuidList(Vec<Uuid>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Bind this value onto a sqlx query. JSON is bound as text; the
    /// placeholder carries an explicit `::JSONB` cast so the backend does
    /// not mis-infer the parameter type.
    pub fn bind_to<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Timestamp(v) => query.bind(v),
            SqlValue::Uuid(v) => query.bind(v),
            SqlValue::Json(v) => query.bind(v.to_string()),
            SqlValue::IntList(v) => query.bind(v),
            SqlValue::FloatList(v) => query.bind(v),
            SqlValue::TextList(v) => query.bind(v),
            SqlValue::BoolList(v) => query.bind(v),
            SqlValue::UuidList(v) => query.bind(v),
        }
    }

    /// Render the value as an inline SQL literal. Strings are single
    /// quoted with embedded quotes doubled; numerics are bare; anything
    /// else refuses inlining and must be parameterized.
    pub fn render_inline(&self) -> Option<String> {
        match self {
            SqlValue::Null => Some("NULL".to_string()),
            SqlValue::Bool(v) => Some(if *v { "TRUE".into() } else { "FALSE".into() }),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(format!("'{}'", v.replace('\'', "''"))),
            _ => None,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(v: JsonValue) -> Self {
        SqlValue::Json(v)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => SqlValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_strings_double_embedded_quotes() {
        let v = SqlValue::Text("it's fine".into());
        assert_eq!(v.render_inline().unwrap(), "'it''s fine'");
    }

    #[test]
    fn inline_numerics_are_bare() {
        assert_eq!(SqlValue::Int(42).render_inline().unwrap(), "42");
        assert_eq!(SqlValue::Float(1.5).render_inline().unwrap(), "1.5");
    }

    #[test]
    fn complex_values_refuse_inlining() {
        assert!(SqlValue::Uuid(Uuid::nil()).render_inline().is_none());
        assert!(SqlValue::Json(serde_json::json!({"a": 1}))
            .render_inline()
            .is_none());
    }

    #[test]
    fn option_maps_to_null() {
        assert_eq!(SqlValue::from(Option::<i64>::None), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(3i64)), SqlValue::Int(3));
    }
}
