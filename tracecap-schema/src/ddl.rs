//! Materializes a [`Schema`] into the `CREATE TABLE`/`CREATE INDEX`
//! statements the store façade executes atomically on first open.

use crate::types::{Schema, Table};

/// One `CREATE TABLE` per table, followed by one `CREATE INDEX` per
/// declared index, in declaration order.
pub fn materialize(schema: &Schema) -> Vec<String> {
    let mut statements = Vec::new();
    for table in &schema.tables {
        statements.push(create_table(table));
        for (i, index_cols) in table.indexes.iter().enumerate() {
            statements.push(create_index(table, i, index_cols));
        }
    }
    statements
}

fn create_table(table: &Table) -> String {
    let cols: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", c.name, c.col_type.sql_type());
            if let Some(default) = &c.default {
                def.push_str(" DEFAULT ");
                def.push_str(&default.sql_literal());
            }
            def
        })
        .collect();
    format!("CREATE TABLE {} ({})", table.name, cols.join(", "))
}

fn create_index(table: &Table, ordinal: usize, columns: &[String]) -> String {
    format!(
        "CREATE INDEX idx_{}_{} ON {} ({})",
        table.name,
        ordinal,
        table.name,
        columns.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{core_schema, TimeType};

    #[test]
    fn materialize_emits_one_create_table_per_table_plus_indexes() {
        let schema = core_schema(5, TimeType::Int).unwrap();
        let statements = materialize(&schema);
        let create_tables = statements
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count();
        let create_indexes = statements
            .iter()
            .filter(|s| s.starts_with("CREATE INDEX"))
            .count();
        assert_eq!(create_tables, schema.tables.len());
        assert_eq!(create_indexes, 1); // only CollectionData.timestamp
        assert!(statements
            .iter()
            .any(|s| s.contains("CollectionData") && s.contains("timestamp")));
    }
}
