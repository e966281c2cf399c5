//! SQL expression tree and its renderer.

pub mod ast;
pub mod compiler;

pub use ast::{
    jsonb_build_object, BinaryOp, ColumnRef, Cte, CteBody, Direction, Distinct, Expr, FromItem,
    FuncCall, InList, Join, JoinKind, Literal, OrderBy, SelectQuery, TableRef,
};
pub use compiler::{Compiled, Compiler};
