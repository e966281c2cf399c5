//! Process-wide namespace registry.
//!
//! Maps model name → namespace, resolves reverse relations for FK
//! auto-fill, and owns schema creation/teardown. The registry is populated
//! while user model code initializes and is frozen by the first
//! `create_all`; later registration attempts are schema errors.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use indexmap::IndexMap;
use tracing::info;

use crate::error::{Error, Result};
use crate::pool::Db;
use crate::schema::declaration::{Model, ModelDeclaration};
use crate::schema::namespace::Namespace;
use crate::schema::parser::parse_declaration;
use crate::schema::relation::RelationInfo;
use crate::versioning::{self, BRANCHES_TABLE, TURNS_TABLE};

#[derive(Default)]
struct RegistryInner {
    namespaces: IndexMap<String, Arc<Namespace>>,
    by_table: HashMap<String, String>,
    /// (child table, fk column) → relation on the owning side.
    reverse: HashMap<(String, String), RelationInfo>,
    frozen: bool,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry models register into.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    /// Register a model type. Write-once per model name.
    pub fn register<M: Model>(&self) -> Result<Arc<Namespace>> {
        self.register_declaration(&M::declaration())
    }

    /// Register from a bare declaration.
    pub fn register_declaration(&self, decl: &ModelDeclaration) -> Result<Arc<Namespace>> {
        let ns = Arc::new(parse_declaration(decl)?);
        let mut inner = self.write();
        if inner.frozen {
            return Err(Error::schema(format!(
                "registry is frozen; cannot register model {}",
                decl.model_name
            )));
        }
        if inner.namespaces.contains_key(&decl.model_name) {
            return Err(Error::DuplicateModel(decl.model_name.clone()));
        }
        if let Some(owner) = inner.by_table.get(&decl.table_name) {
            return Err(Error::schema(format!(
                "table '{}' is already mapped by model {}",
                decl.table_name, owner
            )));
        }

        for rel in ns.relations() {
            if !rel.is_many_to_many() {
                inner.reverse.insert(
                    (rel.foreign_table.clone(), rel.foreign_key.clone()),
                    rel.clone(),
                );
            }
        }
        inner
            .by_table
            .insert(decl.table_name.clone(), decl.model_name.clone());
        inner
            .namespaces
            .insert(decl.model_name.clone(), Arc::clone(&ns));
        Ok(ns)
    }

    pub fn namespace(&self, model_name: &str) -> Result<Arc<Namespace>> {
        self.read()
            .namespaces
            .get(model_name)
            .cloned()
            .ok_or_else(|| Error::schema(format!("model {model_name} is not registered")))
    }

    pub fn namespace_by_table(&self, table: &str) -> Option<Arc<Namespace>> {
        let inner = self.read();
        let model = inner.by_table.get(table)?;
        inner.namespaces.get(model).cloned()
    }

    /// The relation whose foreign side is `(child_table, fk_column)`.
    pub fn reverse_relation(&self, child_table: &str, fk_column: &str) -> Option<RelationInfo> {
        self.read()
            .reverse
            .get(&(child_table.to_string(), fk_column.to_string()))
            .cloned()
    }

    /// All relations declared by the model owning `table`.
    pub fn relations_for(&self, table: &str) -> Vec<RelationInfo> {
        self.namespace_by_table(table)
            .map(|ns| ns.relations().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_namespaces(&self) -> Vec<Arc<Namespace>> {
        self.read().namespaces.values().cloned().collect()
    }

    pub fn is_frozen(&self) -> bool {
        self.read().frozen
    }

    pub fn freeze(&self) {
        self.write().frozen = true;
    }

    /// Check cross-namespace references: FK targets must be registered
    /// tables, relation columns must exist on both sides, junction tables
    /// must carry both keys.
    pub fn validate(&self) -> Result<()> {
        let inner = self.read();
        for ns in inner.namespaces.values() {
            for field in ns.fields() {
                if let Some(target) = &field.referenced_table {
                    let known = target == TURNS_TABLE
                        || target == BRANCHES_TABLE
                        || inner.by_table.contains_key(target);
                    if !known {
                        return Err(Error::schema(format!(
                            "field '{}' on model {} references unknown table '{}'",
                            field.name,
                            ns.model_name(),
                            target
                        )));
                    }
                }
            }
            for rel in ns.relations() {
                let foreign_model = inner.by_table.get(&rel.foreign_table).ok_or_else(|| {
                    Error::schema(format!(
                        "relation '{}' on model {} targets unknown table '{}'",
                        rel.name,
                        ns.model_name(),
                        rel.foreign_table
                    ))
                })?;
                let foreign_ns = &inner.namespaces[foreign_model];
                if let Some((junction_table, local_key, other_key)) = rel.junction() {
                    let junction_model =
                        inner.by_table.get(junction_table).ok_or_else(|| {
                            Error::schema(format!(
                                "relation '{}' on model {} routes through unknown junction '{}'",
                                rel.name,
                                ns.model_name(),
                                junction_table
                            ))
                        })?;
                    let junction_ns = &inner.namespaces[junction_model];
                    for key in [local_key, other_key] {
                        if !junction_ns.has_field(key) {
                            return Err(Error::schema(format!(
                                "junction '{}' is missing key column '{}'",
                                junction_table, key
                            )));
                        }
                    }
                } else if !foreign_ns.has_field(&rel.foreign_key) {
                    return Err(Error::schema(format!(
                        "relation '{}' on model {}: foreign table '{}' has no column '{}'",
                        rel.name,
                        ns.model_name(),
                        rel.foreign_table,
                        rel.foreign_key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create the versioning tables, every registered table, then all
    /// foreign-key constraints (so creation order is irrelevant), and
    /// freeze the registry. Safe to call again: every statement is
    /// idempotent.
    pub async fn create_all(&self, db: &Db) -> Result<()> {
        self.validate()?;

        db.execute_batch(&versioning::versioning_ddl()).await?;
        versioning::ensure_root_branch(db).await?;

        let namespaces = self.all_namespaces();
        for ns in &namespaces {
            info!(table = ns.table_name(), "creating table");
            db.execute_batch(&ns.create_table_sql()).await?;
            for statement in ns.index_statements() {
                db.execute_batch(&statement).await?;
            }
        }
        for ns in &namespaces {
            for statement in self.foreign_key_statements(ns)? {
                db.execute_batch(&statement).await?;
            }
        }

        self.freeze();
        Ok(())
    }

    /// Drop every registered table in reverse registration order, then
    /// the versioning tables.
    pub async fn drop_all(&self, db: &Db) -> Result<()> {
        let mut namespaces = self.all_namespaces();
        namespaces.reverse();
        for ns in namespaces {
            info!(table = ns.table_name(), "dropping table");
            db.execute_batch(&ns.drop_table_sql()).await?;
        }
        db.execute_batch(&format!(
            "DROP TABLE IF EXISTS \"{TURNS_TABLE}\" CASCADE;\nDROP TABLE IF EXISTS \"{BRANCHES_TABLE}\" CASCADE;"
        ))
        .await?;
        Ok(())
    }

    /// Additive FK constraints for one namespace, guarded so a second
    /// `create_all` is a no-op.
    fn foreign_key_statements(&self, ns: &Namespace) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        for field in ns.fields() {
            let Some(target) = &field.referenced_table else {
                continue;
            };
            let referenced_column = match target.as_str() {
                TURNS_TABLE | BRANCHES_TABLE => "id".to_string(),
                other => {
                    let target_ns = self.namespace_by_table(other).ok_or_else(|| {
                        Error::schema(format!("unknown FK target table '{other}'"))
                    })?;
                    target_ns.primary_key()?.name.clone()
                }
            };
            let constraint = format!("fk_{}_{}", ns.table_name(), field.name);
            let actions = self
                .reverse_relation(ns.table_name(), &field.name)
                .map(|rel| {
                    format!(
                        " ON DELETE {} ON UPDATE {}",
                        rel.on_delete.as_sql(),
                        rel.on_update.as_sql()
                    )
                })
                .unwrap_or_default();
            statements.push(format!(
                "DO $$ BEGIN\n    IF NOT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = '{constraint}') THEN\n        ALTER TABLE \"{table}\" ADD CONSTRAINT \"{constraint}\" FOREIGN KEY (\"{column}\") REFERENCES \"{target}\" (\"{referenced}\"){actions};\n    END IF;\nEND $$;",
                table = ns.table_name(),
                column = field.name,
                target = target,
                referenced = referenced_column,
            ));
        }
        Ok(statements)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::declaration::{FieldDecl, RelationDecl};
    use crate::schema::field::LogicalType;

    fn user_decl() -> ModelDeclaration {
        ModelDeclaration::new("User", "users")
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("name", LogicalType::Text))
            .relation(RelationDecl::one_to_many("posts", "Post", "posts", "user_id"))
    }

    fn post_decl() -> ModelDeclaration {
        ModelDeclaration::new("Post", "posts")
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("title", LogicalType::Text))
            .field(FieldDecl::new("user_id", LogicalType::Integer).foreign_key("users"))
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        registry.register_declaration(&user_decl()).unwrap();
        let err = registry.register_declaration(&user_decl()).unwrap_err();
        assert!(matches!(err, Error::DuplicateModel(name) if name == "User"));
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let registry = Registry::new();
        registry.register_declaration(&user_decl()).unwrap();
        registry.freeze();
        let err = registry.register_declaration(&post_decl()).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn reverse_relation_resolves_child_side() {
        let registry = Registry::new();
        registry.register_declaration(&user_decl()).unwrap();
        registry.register_declaration(&post_decl()).unwrap();

        let rel = registry.reverse_relation("posts", "user_id").unwrap();
        assert_eq!(rel.table, "users");
        assert_eq!(rel.name, "posts");
        assert!(registry.reverse_relation("posts", "title").is_none());
    }

    #[test]
    fn validate_catches_dangling_relation() {
        let registry = Registry::new();
        registry.register_declaration(&user_decl()).unwrap();
        // Post never registered: the users → posts relation dangles.
        let err = registry.validate().unwrap_err();
        assert!(matches!(err, Error::Schema(_)));

        registry.register_declaration(&post_decl()).unwrap();
        registry.validate().unwrap();
    }

    #[test]
    fn validate_checks_junction_keys() {
        let registry = Registry::new();
        registry
            .register_declaration(
                &ModelDeclaration::new("User", "users")
                    .field(FieldDecl::serial_key("id"))
                    .relation(RelationDecl::many_to_many(
                        "comments",
                        "Comment",
                        "comments",
                        "user_comment_rel",
                        ("user_id", "comment_id"),
                    )),
            )
            .unwrap();
        registry
            .register_declaration(
                &ModelDeclaration::new("Comment", "comments")
                    .field(FieldDecl::serial_key("id"))
                    .field(FieldDecl::new("content", LogicalType::Text)),
            )
            .unwrap();
        registry
            .register_declaration(
                &ModelDeclaration::new("UserCommentRel", "user_comment_rel")
                    .field(FieldDecl::serial_key("id"))
                    .field(FieldDecl::new("user_id", LogicalType::Integer).foreign_key("users"))
                    .field(
                        FieldDecl::new("comment_id", LogicalType::Integer)
                            .foreign_key("comments"),
                    ),
            )
            .unwrap();
        registry.validate().unwrap();
    }

    #[test]
    fn fk_statements_are_guarded_and_carry_actions() {
        let registry = Registry::new();
        registry.register_declaration(&user_decl()).unwrap();
        let post_ns = registry.register_declaration(&post_decl()).unwrap();

        let statements = registry.foreign_key_statements(&post_ns).unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("IF NOT EXISTS"));
        assert!(statements[0].contains("fk_posts_user_id"));
        assert!(statements[0].contains("ON DELETE CASCADE"));
    }
}
