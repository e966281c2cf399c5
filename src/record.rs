//! Ordered column → value map.
//!
//! The exchange format between models and namespaces: a model dumps
//! itself into a `Record` before a save, and is rebuilt from one after a
//! fetch. Columns keep insertion order so statement text is stable.

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::SqlValue;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: IndexMap<String, SqlValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<SqlValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.values.get(name)
    }

    pub fn take(&mut self, name: &str) -> Option<SqlValue> {
        self.values.shift_remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SqlValue)> {
        self.values.iter()
    }

    fn missing(&self, name: &str) -> Error {
        Error::decode(name, "column missing from record")
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(SqlValue::Int(v)) => Ok(*v),
            Some(other) => Err(Error::decode(name, format!("expected integer, got {other:?}"))),
            None => Err(self.missing(name)),
        }
    }

    pub fn opt_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            Some(SqlValue::Int(v)) => Ok(Some(*v)),
            Some(SqlValue::Null) | None => Ok(None),
            Some(other) => Err(Error::decode(name, format!("expected integer, got {other:?}"))),
        }
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        match self.get(name) {
            Some(SqlValue::Float(v)) => Ok(*v),
            Some(SqlValue::Int(v)) => Ok(*v as f64),
            Some(other) => Err(Error::decode(name, format!("expected float, got {other:?}"))),
            None => Err(self.missing(name)),
        }
    }

    pub fn text(&self, name: &str) -> Result<String> {
        match self.get(name) {
            Some(SqlValue::Text(v)) => Ok(v.clone()),
            Some(other) => Err(Error::decode(name, format!("expected text, got {other:?}"))),
            None => Err(self.missing(name)),
        }
    }

    pub fn opt_text(&self, name: &str) -> Result<Option<String>> {
        match self.get(name) {
            Some(SqlValue::Text(v)) => Ok(Some(v.clone())),
            Some(SqlValue::Null) | None => Ok(None),
            Some(other) => Err(Error::decode(name, format!("expected text, got {other:?}"))),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Some(SqlValue::Bool(v)) => Ok(*v),
            Some(other) => Err(Error::decode(name, format!("expected bool, got {other:?}"))),
            None => Err(self.missing(name)),
        }
    }

    pub fn uuid(&self, name: &str) -> Result<Uuid> {
        match self.get(name) {
            Some(SqlValue::Uuid(v)) => Ok(*v),
            Some(other) => Err(Error::decode(name, format!("expected uuid, got {other:?}"))),
            None => Err(self.missing(name)),
        }
    }

    pub fn opt_uuid(&self, name: &str) -> Result<Option<Uuid>> {
        match self.get(name) {
            Some(SqlValue::Uuid(v)) => Ok(Some(*v)),
            Some(SqlValue::Null) | None => Ok(None),
            Some(other) => Err(Error::decode(name, format!("expected uuid, got {other:?}"))),
        }
    }

    pub fn timestamp(&self, name: &str) -> Result<NaiveDateTime> {
        match self.get(name) {
            Some(SqlValue::Timestamp(v)) => Ok(*v),
            Some(other) => Err(Error::decode(
                name,
                format!("expected timestamp, got {other:?}"),
            )),
            None => Err(self.missing(name)),
        }
    }

    pub fn opt_timestamp(&self, name: &str) -> Result<Option<NaiveDateTime>> {
        match self.get(name) {
            Some(SqlValue::Timestamp(v)) => Ok(Some(*v)),
            Some(SqlValue::Null) | None => Ok(None),
            Some(other) => Err(Error::decode(
                name,
                format!("expected timestamp, got {other:?}"),
            )),
        }
    }

    pub fn json(&self, name: &str) -> Result<JsonValue> {
        match self.get(name) {
            Some(SqlValue::Json(v)) => Ok(v.clone()),
            Some(other) => Err(Error::decode(name, format!("expected json, got {other:?}"))),
            None => Err(self.missing(name)),
        }
    }

    /// Take a relation column as the array of child objects emitted by a
    /// nested fetch. Missing and NULL both mean "no children fetched".
    pub fn take_json_array(&mut self, name: &str) -> Result<Vec<JsonValue>> {
        match self.take(name) {
            Some(SqlValue::Json(JsonValue::Array(items))) => Ok(items),
            Some(SqlValue::Json(other)) => Err(Error::decode(
                name,
                format!("expected json array, got {other}"),
            )),
            Some(SqlValue::Null) | None => Ok(Vec::new()),
            Some(other) => Err(Error::decode(name, format!("expected json, got {other:?}"))),
        }
    }
}

impl FromIterator<(String, SqlValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, SqlValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut rec = Record::new();
        rec.set("id", 7i64);
        rec.set("name", "Ada");
        rec.set("deleted_at", SqlValue::Null);

        assert_eq!(rec.i64("id").unwrap(), 7);
        assert_eq!(rec.text("name").unwrap(), "Ada");
        assert_eq!(rec.opt_timestamp("deleted_at").unwrap(), None);
        assert!(rec.i64("name").is_err());
        assert!(rec.i64("nope").is_err());
    }

    #[test]
    fn take_json_array_tolerates_missing_relation() {
        let mut rec = Record::new();
        assert!(rec.take_json_array("posts").unwrap().is_empty());

        rec.set("posts", serde_json::json!([{"id": 1}]));
        assert_eq!(rec.take_json_array("posts").unwrap().len(), 1);
        assert!(!rec.contains("posts"));
    }

    #[test]
    fn keeps_insertion_order() {
        let mut rec = Record::new();
        rec.set("b", 1i64);
        rec.set("a", 2i64);
        let keys: Vec<_> = rec.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
