//! Error types for the ORM core.

use thiserror::Error;

/// Errors surfaced by schema registration, query compilation and execution.
///
/// The compiler and query builders never perform I/O, so they can only
/// produce `Schema`, `Compile` or `Bind`. Transport errors come out of the
/// pool unchanged; statement errors carry the SQL text that caused them.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed model declaration: duplicate primary key, unknown field
    /// type, missing FK target, reserved field name.
    #[error("schema error: {0}")]
    Schema(String),

    /// A model name was registered twice.
    #[error("duplicate model: {0}")]
    DuplicateModel(String),

    /// The AST cannot be rendered to SQL.
    #[error("compile error: {0}")]
    Compile(String),

    /// A caller-supplied value was rejected by a field's serializer.
    #[error("bind error on field {field}: {message}")]
    Bind { field: String, message: String },

    /// A point lookup returned zero rows.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint violation, surfaced with the constraint name.
    #[error("duplicate key: constraint {constraint}")]
    DuplicateKey { constraint: String },

    /// A save would leave a required foreign key null and no parent is in
    /// scope to fill it.
    #[error("missing foreign key {field} on {model}")]
    MissingForeignKey { model: String, field: String },

    /// Operation inconsistent with turn state: commit of a non-staged
    /// turn, save against a reverted turn, fork from a missing turn.
    #[error("versioning error: {0}")]
    Versioning(String),

    /// Deserialization of a stored value failed.
    #[error("decode error on column {column}: {message}")]
    Decode { column: String, message: String },

    /// The pool could not produce a connection in time, or the statement
    /// hit the configured statement timeout.
    #[error("timeout")]
    Timeout,

    /// The caller's task was cancelled while a statement was in flight.
    #[error("cancelled")]
    Cancelled,

    /// The connection died underneath us.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Any other backend failure, with the statement and its parameter
    /// list attached for diagnostics.
    #[error("database error: {message} (sql: {sql}; params: {params})")]
    Database {
        message: String,
        sql: String,
        params: String,
    },
}

impl Error {
    pub fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        Error::Compile(msg.into())
    }

    pub fn versioning(msg: impl Into<String>) -> Self {
        Error::Versioning(msg.into())
    }

    pub fn decode(column: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Decode {
            column: column.into(),
            message: msg.into(),
        }
    }

    pub fn bind(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Bind {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// True for transport-layer failures where a retry by the caller may
    /// succeed. The core itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Cancelled | Error::ConnectionLost(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::bind("age", "expected integer");
        assert_eq!(err.to_string(), "bind error on field age: expected integer");

        let err = Error::DuplicateKey {
            constraint: "users_email_key".into(),
        };
        assert!(err.to_string().contains("users_email_key"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(!Error::schema("bad").is_transient());
    }
}
