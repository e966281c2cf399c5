//! turntable — a branch-versioned ORM core for PostgreSQL.
//!
//! Rows logically belong to a *turn* on a *branch*; branches fork from any
//! turn of a parent, and reads resolve the rows visible from a chosen
//! branch head — a checkout over rows rather than files. The crate covers
//! the relational core: schema registration from declarative model
//! descriptions, a composable SQL expression tree with a parameterizing
//! compiler, a fluent query-set builder with nested relation fetches, and
//! the branch/turn versioning engine itself.
//!
//! ```no_run
//! use turntable::{
//!     Db, FieldDecl, LogicalType, Model, ModelDeclaration, OrmConfig, Record, Registry,
//! };
//!
//! struct User {
//!     id: Option<i32>,
//!     name: String,
//!     age: i64,
//! }
//!
//! impl Model for User {
//!     const MODEL_NAME: &'static str = "User";
//!
//!     fn declaration() -> ModelDeclaration {
//!         ModelDeclaration::new("User", "users")
//!             .field(FieldDecl::serial_key("id"))
//!             .field(FieldDecl::new("name", LogicalType::Text))
//!             .field(FieldDecl::new("age", LogicalType::Integer))
//!     }
//!
//!     fn to_record(&self) -> Record {
//!         Record::new()
//!             .with("id", self.id.map(i64::from))
//!             .with("name", self.name.clone())
//!             .with("age", self.age)
//!     }
//!
//!     fn from_record(record: Record) -> turntable::Result<Self> {
//!         Ok(Self {
//!             id: record.opt_i64("id")?.map(|id| id as i32),
//!             name: record.text("name")?,
//!             age: record.i64("age")?,
//!         })
//!     }
//! }
//!
//! # async fn run() -> turntable::Result<()> {
//! Registry::global().register::<User>()?;
//! let db = Db::connect(&OrmConfig::default()).await?;
//! Registry::global().create_all(&db).await?;
//!
//! let adults = User::query()?
//!     .filter(|u| u.col("age").gt(21i64))
//!     .order_by(&["-age"])
//!     .fetch_all(&db)
//!     .await?;
//! # drop(adults);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod pool;
pub mod query;
pub mod record;
pub mod schema;
pub mod sql;
pub mod value;
pub mod versioning;

pub use config::OrmConfig;
pub use error::{Error, Result};
pub use pool::{Db, DbTransaction};
pub use query::{SelectSet, SingleRow};
pub use record::Record;
pub use schema::{
    decode_children, FieldDecl, FieldDescriptor, IndexKind, LogicalType, Model, ModelDeclaration,
    ModelKind, Primitive, ReferentialAction, Registry, RelationDecl,
};
pub use value::SqlValue;
pub use versioning::{context::Context, Branch, Turn, TurnStatus};
