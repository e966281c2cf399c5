//! Declaration → namespace translation.
//!
//! Deterministic: walks a model declaration and emits `add_field` /
//! `add_relation` calls on a fresh namespace. Versioned models get their
//! version-control columns appended here, so user declarations never
//! mention them — declaring one is a schema error.

use crate::error::{Error, Result};
use crate::schema::declaration::{FieldDecl, ModelDeclaration, ModelKind, RelationDecl};
use crate::schema::field::{FieldDescriptor, IndexKind, LogicalType};
use crate::schema::namespace::{
    Namespace, ARTIFACT_ID_COLUMN, BRANCH_ID_COLUMN, DELETED_AT_COLUMN, TURN_ID_COLUMN,
    UPDATED_AT_COLUMN, VERSION_COLUMN,
};
use crate::schema::relation::{RelationInfo, RelationKind};
use crate::versioning::{BRANCHES_TABLE, TURNS_TABLE};

/// Columns owned by the versioning engine.
const RESERVED_COLUMNS: &[&str] = &[
    TURN_ID_COLUMN,
    BRANCH_ID_COLUMN,
    ARTIFACT_ID_COLUMN,
    VERSION_COLUMN,
    DELETED_AT_COLUMN,
];

/// Build a namespace from a model declaration.
pub fn parse_declaration(decl: &ModelDeclaration) -> Result<Namespace> {
    if decl.fields.is_empty() {
        return Err(Error::schema(format!(
            "model {} declares no fields",
            decl.model_name
        )));
    }

    let declared_keys = decl.fields.iter().filter(|f| f.primary_key).count();
    if declared_keys == 0 {
        return Err(Error::schema(format!(
            "model {} has no primary key",
            decl.model_name
        )));
    }

    if decl.kind != ModelKind::Plain {
        for field in &decl.fields {
            if RESERVED_COLUMNS.contains(&field.name.as_str()) {
                return Err(Error::schema(format!(
                    "field '{}' on model {} is reserved for the versioning engine",
                    field.name, decl.model_name
                )));
            }
        }
    }

    let mut ns = Namespace::new(&decl.model_name, &decl.table_name, decl.kind);
    for field in &decl.fields {
        ns.add_field(descriptor_from_decl(field))?;
    }

    append_engine_columns(&mut ns, decl)?;

    for relation in &decl.relations {
        ns.add_relation(relation_from_decl(&ns, relation)?)?;
    }

    Ok(ns)
}

fn descriptor_from_decl(decl: &FieldDecl) -> FieldDescriptor {
    let mut field = FieldDescriptor::new(&decl.name, decl.logical.clone());
    if decl.primary_key {
        field = field.primary_key();
    }
    if decl.optional {
        field = field.optional();
    }
    if let Some(table) = &decl.foreign_key {
        field = field.foreign_key(table.clone());
    }
    if let Some(expr) = &decl.default_expr {
        field = field.default_expr(expr.clone());
    }
    if decl.default_temporal {
        field = field.default_temporal();
    }
    if let Some(kind) = decl.index {
        field = field.index(kind);
    }
    field
}

/// Append the columns the versioning engine owns: the created-at column
/// when none is declared, `turn_id`/`branch_id` for versioned models, and
/// the artifact triple for artifact models.
fn append_engine_columns(ns: &mut Namespace, decl: &ModelDeclaration) -> Result<()> {
    if decl.kind == ModelKind::Plain {
        return Ok(());
    }

    if !ns.has_field("created_at") {
        let mut created = FieldDescriptor::new("created_at", LogicalType::Timestamp)
            .default_expr("NOW()");
        if ns.default_temporal().is_none() {
            created = created.default_temporal();
        }
        ns.add_field(created)?;
    }
    if !ns.has_field(UPDATED_AT_COLUMN) {
        ns.add_field(
            FieldDescriptor::new(UPDATED_AT_COLUMN, LogicalType::Timestamp).optional(),
        )?;
    }

    ns.add_field(
        FieldDescriptor::new(TURN_ID_COLUMN, LogicalType::Integer)
            .foreign_key(TURNS_TABLE)
            .index(IndexKind::Btree),
    )?;
    ns.add_field(
        FieldDescriptor::new(BRANCH_ID_COLUMN, LogicalType::Integer)
            .foreign_key(BRANCHES_TABLE)
            .index(IndexKind::Btree),
    )?;

    if decl.kind == ModelKind::Artifact {
        ns.add_field(
            FieldDescriptor::new(ARTIFACT_ID_COLUMN, LogicalType::Uuid).index(IndexKind::Btree),
        )?;
        ns.add_field(
            FieldDescriptor::new(VERSION_COLUMN, LogicalType::Integer).default_expr("1"),
        )?;
        ns.add_field(
            FieldDescriptor::new(DELETED_AT_COLUMN, LogicalType::Timestamp).optional(),
        )?;
    }
    Ok(())
}

fn relation_from_decl(ns: &Namespace, decl: &RelationDecl) -> Result<RelationInfo> {
    let primary_key = match &decl.primary_key {
        Some(column) => column.clone(),
        None => ns.primary_key()?.name.clone(),
    };
    let kind = match (&decl.junction, decl.one_to_one) {
        (Some((junction_table, junction_keys)), _) => RelationKind::ManyToMany {
            junction_table: junction_table.clone(),
            junction_keys: junction_keys.clone(),
        },
        (None, true) => RelationKind::OneToOne,
        (None, false) => RelationKind::OneToMany,
    };
    Ok(RelationInfo {
        name: decl.name.clone(),
        table: ns.table_name().to_string(),
        primary_key,
        foreign_table: decl.foreign_table.clone(),
        foreign_key: decl.foreign_key.clone(),
        foreign_model: decl.foreign_model.clone(),
        kind,
        on_delete: decl.on_delete,
        on_update: decl.on_update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::declaration::{FieldDecl, RelationDecl};

    fn post_declaration() -> ModelDeclaration {
        ModelDeclaration::new("Post", "posts")
            .versioned()
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("title", LogicalType::Text))
            .field(FieldDecl::new("user_id", LogicalType::Integer).foreign_key("users"))
            .relation(RelationDecl::one_to_many(
                "comments", "Comment", "comments", "post_id",
            ))
    }

    #[test]
    fn versioned_models_get_engine_columns() {
        let ns = parse_declaration(&post_declaration()).unwrap();
        assert!(ns.has_field("turn_id"));
        assert!(ns.has_field("branch_id"));
        assert!(ns.has_field("created_at"));
        assert!(!ns.has_field("artifact_id"));
        assert_eq!(ns.default_temporal(), Some("created_at"));

        let turn_id = ns.field("turn_id").unwrap();
        assert_eq!(turn_id.referenced_table.as_deref(), Some("turns"));
    }

    #[test]
    fn artifact_models_get_artifact_columns() {
        let decl = ModelDeclaration::new("Note", "notes")
            .artifact()
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("content", LogicalType::Text));
        let ns = parse_declaration(&decl).unwrap();
        assert!(ns.has_field("artifact_id"));
        assert!(ns.has_field("version"));
        assert!(ns.has_field("deleted_at"));
        assert!(ns.has_field("updated_at"));
    }

    #[test]
    fn reserved_column_is_rejected() {
        let decl = ModelDeclaration::new("Bad", "bad")
            .versioned()
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("turn_id", LogicalType::Integer));
        let err = parse_declaration(&decl).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn missing_primary_key_is_rejected() {
        let decl = ModelDeclaration::new("Bad", "bad")
            .field(FieldDecl::new("name", LogicalType::Text));
        let err = parse_declaration(&decl).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn relation_defaults_to_namespace_primary_key() {
        let ns = parse_declaration(&post_declaration()).unwrap();
        let rel = ns.relation("comments").unwrap();
        assert_eq!(rel.primary_key, "id");
        assert_eq!(rel.foreign_key, "post_id");
        assert_eq!(rel.foreign_table, "comments");
    }

    #[test]
    fn plain_models_are_untouched() {
        let decl = ModelDeclaration::new("Tag", "tags")
            .field(FieldDecl::serial_key("id"))
            .field(FieldDecl::new("label", LogicalType::Text));
        let ns = parse_declaration(&decl).unwrap();
        assert!(!ns.has_field("turn_id"));
        assert!(!ns.has_field("created_at"));
    }
}
