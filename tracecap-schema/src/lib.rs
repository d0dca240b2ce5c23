//! Declarative description of relational tables, typed columns, default
//! values, and secondary indexes, materialized into SQLite DDL.
//!
//! This is a data-driven schema, not a derive macro: a [`SchemaBuilder`]
//! accumulates [`Table`] descriptions and [`SchemaBuilder::build`] turns
//! them into a [`Schema`] the store façade can execute once, atomically,
//! on first open.

mod builder;
mod builtin;
mod ddl;
mod types;

pub use builder::{SchemaBuilder, TableBuilder};
pub use builtin::{core_schema, TimeType};
pub use ddl::materialize;
pub use types::{Column, ColumnDefault, ColumnType, Schema, Table};
