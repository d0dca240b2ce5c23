//! Imperative builder over the plain [`crate::types`] data. Mirrors the
//! shape of `ckb-db-schema`'s column-family constants, but data-driven
//! rather than compiled-in: callers build up a [`Schema`] at runtime and
//! the result is handed to the store façade once.

use crate::types::{Column, ColumnDefault, ColumnType, Schema, Table};
use tracecap_error::{Error, Result};

#[derive(Default)]
pub struct SchemaBuilder {
    tables: Vec<Table>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start describing a new table. Fails immediately if a table with
    /// this name has already been added to this builder.
    pub fn add_table(&mut self, name: impl Into<String>) -> Result<TableBuilder<'_>> {
        let name = name.into();
        if self.tables.iter().any(|t| t.name == name) {
            return Err(Error::schema(format!("duplicate table `{name}`")));
        }
        Ok(TableBuilder {
            schema: self,
            table: Table {
                name,
                columns: Vec::new(),
                indexes: Vec::new(),
            },
        })
    }

    pub fn build(self) -> Schema {
        Schema {
            tables: self.tables,
        }
    }
}

/// Describes one table's columns and indexes. Dropping the builder
/// without calling [`TableBuilder::finish`] discards the table; this
/// matches the usual "build, then commit" shape used throughout the
/// workspace's other builders.
pub struct TableBuilder<'a> {
    schema: &'a mut SchemaBuilder,
    table: Table,
}

impl<'a> TableBuilder<'a> {
    pub fn column(mut self, name: impl Into<String>, col_type: ColumnType) -> Result<Self> {
        self.push_column(name.into(), col_type, None)?;
        Ok(self)
    }

    pub fn column_with_default(
        mut self,
        name: impl Into<String>,
        col_type: ColumnType,
        default: ColumnDefault,
    ) -> Result<Self> {
        self.push_column(name.into(), col_type, Some(default))?;
        Ok(self)
    }

    fn push_column(
        &mut self,
        name: String,
        col_type: ColumnType,
        default: Option<ColumnDefault>,
    ) -> Result<()> {
        if self.table.columns.iter().any(|c| c.name == name) {
            return Err(Error::schema(format!(
                "duplicate column `{name}` in table `{}`",
                self.table.name
            )));
        }
        if default.is_some() && col_type == ColumnType::Blob {
            return Err(Error::schema(format!(
                "column `{name}` in table `{}` cannot have a default: blob columns never do",
                self.table.name
            )));
        }
        self.table.columns.push(Column {
            name,
            col_type,
            default,
        });
        Ok(())
    }

    /// Add a (possibly compound) index over the given columns, in order.
    /// Every named column must already have been added via `column`.
    pub fn index(mut self, columns: &[&str]) -> Result<Self> {
        for col in columns {
            if self.table.column(col).is_none() {
                return Err(Error::schema(format!(
                    "index references unknown column `{col}` in table `{}`",
                    self.table.name
                )));
            }
        }
        self.table
            .indexes
            .push(columns.iter().map(|c| c.to_string()).collect());
        Ok(self)
    }

    /// Commit this table into the owning `SchemaBuilder`.
    pub fn finish(self) {
        self.schema.tables.push(self.table);
    }
}
