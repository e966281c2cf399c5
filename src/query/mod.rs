//! Fluent query sets over registered models.

pub mod builder;
pub(crate) mod nested;

pub use builder::{ColExpr, Cols, SelectSet, SingleRow};
