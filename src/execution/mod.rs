//! Query execution against the relational store

pub mod backend;
pub mod result;

pub use backend::{PgBackend, QueryBackend, QueryExecutor};
pub use result::{RawTable, RawValue};
