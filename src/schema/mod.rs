//! Schema registration: declarations, field descriptors, namespaces and
//! the process-wide registry.

pub mod declaration;
pub mod field;
pub mod namespace;
pub mod parser;
pub mod registry;
pub mod relation;

pub use declaration::{decode_children, FieldDecl, Model, ModelDeclaration, ModelKind, RelationDecl};
pub use field::{FieldDescriptor, IndexKind, LogicalType, Primitive};
pub use namespace::Namespace;
pub use parser::parse_declaration;
pub use registry::Registry;
pub use relation::{add_related, related_query, ReferentialAction, RelationInfo, RelationKind};
