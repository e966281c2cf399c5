//! Task-local version context.
//!
//! Carries the branch and turn that writes are stamped with, plus the
//! stack of parent rows used for reverse foreign-key auto-fill. The
//! context is task-local, never global: concurrent tasks each see only
//! their own scope, and nested scopes shadow outer ones.

use crate::error::{Error, Result};
use crate::schema::declaration::Model;
use crate::value::SqlValue;

#[derive(Debug, Clone, Default)]
pub struct Context {
    branch_id: Option<i32>,
    turn_id: Option<i32>,
    /// (table, primary key value) of rows in scope; later entries shadow
    /// earlier ones.
    parents: Vec<(String, SqlValue)>,
}

tokio::task_local! {
    static CONTEXT: Context;
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the ambient context, if any.
    pub fn current() -> Option<Context> {
        CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    /// The ambient context, or an empty one to extend.
    pub fn current_or_default() -> Context {
        Self::current().unwrap_or_default()
    }

    pub fn with_branch(mut self, branch_id: i32) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_turn(mut self, turn_id: i32) -> Self {
        self.turn_id = Some(turn_id);
        self
    }

    pub fn with_parent(mut self, table: impl Into<String>, primary_key: SqlValue) -> Self {
        self.parents.push((table.into(), primary_key));
        self
    }

    pub fn branch_id(&self) -> Option<i32> {
        self.branch_id
    }

    pub fn turn_id(&self) -> Option<i32> {
        self.turn_id
    }

    /// Run a future with this context installed for the task.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CONTEXT.scope(self, fut).await
    }
}

/// Branch the ambient context selects, if any.
pub fn current_branch_id() -> Option<i32> {
    Context::current().and_then(|ctx| ctx.branch_id)
}

/// Turn the ambient context selects, if any.
pub fn current_turn_id() -> Option<i32> {
    Context::current().and_then(|ctx| ctx.turn_id)
}

/// Primary key of the innermost in-scope parent stored in `table`.
pub fn parent_in_scope(table: &str) -> Option<SqlValue> {
    Context::current().and_then(|ctx| {
        ctx.parents
            .iter()
            .rev()
            .find(|(t, _)| t == table)
            .map(|(_, pk)| pk.clone())
    })
}

/// Extend the ambient context with `model` as an in-scope parent, so
/// children saved inside the scope get their foreign key auto-filled.
pub fn scoped_to<M: Model>(model: &M) -> Result<Context> {
    let ns = M::namespace()?;
    let pk = ns.primary_key()?;
    let value = model
        .to_record()
        .get(&pk.name)
        .cloned()
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::bind(&pk.name, "model put in scope has no primary key value"))?;
    Ok(Context::current_or_default().with_parent(ns.table_name(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::record::Record;
    use crate::schema::declaration::{FieldDecl, ModelDeclaration};
    use crate::schema::field::LogicalType;
    use crate::schema::registry::Registry;

    struct ScopeUser {
        id: Option<i64>,
    }

    impl Model for ScopeUser {
        const MODEL_NAME: &'static str = "ScopeUser";

        fn declaration() -> ModelDeclaration {
            ModelDeclaration::new("ScopeUser", "scope_users")
                .field(FieldDecl::serial_key("id"))
                .field(FieldDecl::new("name", LogicalType::Text).optional())
        }

        fn to_record(&self) -> Record {
            Record::new().with("id", self.id)
        }

        fn from_record(record: Record) -> Result<Self> {
            Ok(Self {
                id: record.opt_i64("id")?,
            })
        }
    }

    fn register_scope_user() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            Registry::global().register::<ScopeUser>().unwrap();
        });
    }

    #[tokio::test]
    async fn scoped_to_puts_the_parent_in_scope() {
        register_scope_user();
        let parent = ScopeUser { id: Some(9) };

        scoped_to(&parent)
            .unwrap()
            .scope(async {
                // Reverse-FK auto-fill resolves the parent through this
                // lookup during a child save.
                assert_eq!(parent_in_scope("scope_users"), Some(SqlValue::Int(9)));
            })
            .await;
        assert_eq!(parent_in_scope("scope_users"), None);
    }

    #[tokio::test]
    async fn scoped_to_rejects_unsaved_parent() {
        register_scope_user();
        let unsaved = ScopeUser { id: None };
        assert!(scoped_to(&unsaved).is_err());
    }

    #[tokio::test]
    async fn scopes_nest_and_shadow() {
        assert!(current_branch_id().is_none());

        let outer = Context::new()
            .with_branch(1)
            .with_parent("users", SqlValue::Int(7));
        outer
            .scope(async {
                assert_eq!(current_branch_id(), Some(1));
                assert_eq!(parent_in_scope("users"), Some(SqlValue::Int(7)));

                let inner = Context::current_or_default()
                    .with_branch(2)
                    .with_parent("users", SqlValue::Int(9));
                inner
                    .scope(async {
                        assert_eq!(current_branch_id(), Some(2));
                        assert_eq!(parent_in_scope("users"), Some(SqlValue::Int(9)));
                    })
                    .await;

                assert_eq!(current_branch_id(), Some(1));
                assert_eq!(parent_in_scope("users"), Some(SqlValue::Int(7)));
            })
            .await;

        assert!(current_branch_id().is_none());
    }

    #[tokio::test]
    async fn tasks_do_not_leak_context() {
        let ctx = Context::new().with_turn(5);
        ctx.scope(async {
            let handle = tokio::spawn(async { current_turn_id() });
            // A freshly spawned task has its own (empty) context.
            assert_eq!(handle.await.unwrap(), None);
            assert_eq!(current_turn_id(), Some(5));
        })
        .await;
    }
}
