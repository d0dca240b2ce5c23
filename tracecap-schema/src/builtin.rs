//! The fixed, built-in schema every `tracecap` store carries: Collections,
//! CollectionData, StructFields, EnumDefns, StringMap, ElementTreeNodes,
//! Clocks, CollectionGlobals. Unlike a user struct's fields (which are
//! data-driven, via `TypeRegistry`), these tables are the same for every
//! capture engine, so they are constructed once here rather than
//! re-derived by callers.

use crate::builder::SchemaBuilder;
use crate::types::{ColumnDefault, ColumnType, Schema};
use tracecap_error::Result;

/// The wire type of the clock driving a `CollectionManager`. Recorded in
/// `CollectionGlobals.time_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeType {
    Int,
    Real,
}

impl TimeType {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeType::Int => "INT",
            TimeType::Real => "REAL",
        }
    }
}

/// Build the fixed schema shared by every store, seeded with the chosen
/// heartbeat and timestamp wire type: both defaults are recorded into
/// `CollectionGlobals` rather than left implicit.
pub fn core_schema(heartbeat: u16, time_type: TimeType) -> Result<Schema> {
    let mut builder = SchemaBuilder::new();

    builder
        .add_table("Collections")?
        .column("id", ColumnType::U32)?
        .column("name", ColumnType::Text)?
        .column("data_type", ColumnType::Text)?
        .column("is_container", ColumnType::I32)?
        .column("is_sparse", ColumnType::I32)?
        .column("capacity", ColumnType::U32)?
        .finish();

    builder
        .add_table("CollectionData")?
        .column("id", ColumnType::U32)?
        .column("timestamp", ColumnType::Double)?
        .column("data_vals", ColumnType::Blob)?
        .column("is_compressed", ColumnType::I32)?
        .index(&["timestamp"])?
        .finish();

    builder
        .add_table("StructFields")?
        .column("struct_name", ColumnType::Text)?
        .column("field_name", ColumnType::Text)?
        .column("field_type", ColumnType::Text)?
        .column("format_code", ColumnType::Text)?
        .column("is_color_key", ColumnType::I32)?
        .column("visible_by_default", ColumnType::I32)?
        .finish();

    builder
        .add_table("EnumDefns")?
        .column("enum_name", ColumnType::Text)?
        .column("label", ColumnType::Text)?
        .column("value_blob", ColumnType::Blob)?
        .column("underlying_type", ColumnType::Text)?
        .finish();

    builder
        .add_table("StringMap")?
        .column("id", ColumnType::U32)?
        .column("text", ColumnType::Text)?
        .finish();

    builder
        .add_table("ElementTreeNodes")?
        .column("id", ColumnType::U32)?
        .column("name", ColumnType::Text)?
        .column("parent_id", ColumnType::I64)?
        .column("clock_id", ColumnType::I64)?
        .column("collection_id", ColumnType::I64)?
        .column("offset", ColumnType::I64)?
        .column("widget_hint", ColumnType::Text)?
        .finish();

    builder
        .add_table("Clocks")?
        .column("id", ColumnType::U32)?
        .column("name", ColumnType::Text)?
        .column("period", ColumnType::U32)?
        .finish();

    builder
        .add_table("CollectionGlobals")?
        .column_with_default(
            "time_type",
            ColumnType::Text,
            ColumnDefault::Text(time_type.as_str().to_string()),
        )?
        .column_with_default(
            "heartbeat",
            ColumnType::I32,
            ColumnDefault::Int(i64::from(heartbeat)),
        )?
        .finish();

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_schema_has_the_eight_spec_tables() {
        let schema = core_schema(5, TimeType::Int).unwrap();
        let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Collections",
                "CollectionData",
                "StructFields",
                "EnumDefns",
                "StringMap",
                "ElementTreeNodes",
                "Clocks",
                "CollectionGlobals",
            ]
        );
    }

    #[test]
    fn collection_data_is_indexed_on_timestamp() {
        let schema = core_schema(5, TimeType::Real).unwrap();
        let table = schema.table("CollectionData").unwrap();
        assert_eq!(table.indexes, vec![vec!["timestamp".to_string()]]);
    }

    #[test]
    fn collection_globals_carries_the_chosen_defaults() {
        let schema = core_schema(7, TimeType::Real).unwrap();
        let table = schema.table("CollectionGlobals").unwrap();
        let heartbeat = table.column("heartbeat").unwrap();
        assert_eq!(heartbeat.default, Some(ColumnDefault::Int(7)));
        let time_type = table.column("time_type").unwrap();
        assert_eq!(
            time_type.default,
            Some(ColumnDefault::Text("REAL".to_string()))
        );
    }
}
