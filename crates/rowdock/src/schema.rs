//! Schema introspection
//!
//! Reads a live table's columns in declaration order and checks incoming
//! records and staging tables against them.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::dialect::DialectAdapter;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{ColumnDescriptor, Row, SourceSchema, TableId, TableSchema, Value};

/// Derives and validates table schemas through a dialect's catalog queries
#[derive(Debug, Clone)]
pub struct SchemaIntrospector {
    dialect: Arc<dyn DialectAdapter>,
}

impl SchemaIntrospector {
    /// Create an introspector for a dialect
    pub fn new(dialect: Arc<dyn DialectAdapter>) -> Self {
        Self { dialect }
    }

    /// Columns of `table` in physical declaration order.
    ///
    /// Fails with [`ErrorKind::NotFound`] when the table does not exist.
    pub async fn describe(&self, conn: &dyn Connection, table: &TableId) -> Result<TableSchema> {
        let rows = conn
            .query(&self.dialect.list_columns_sql(table), &[])
            .await?;
        if rows.is_empty() {
            return Err(Error::table_not_found(table.qualified_name()));
        }
        let mut columns = rows
            .iter()
            .map(column_from_row)
            .collect::<Result<Vec<_>>>()?;
        columns.sort_by_key(|c| c.ordinal);
        let unique_keys = match self.dialect.unique_keys_sql(table) {
            Some(sql) => unique_keys_from_rows(&conn.query(&sql, &[]).await?),
            None => Vec::new(),
        };
        Ok(TableSchema::new(columns).with_unique_keys(unique_keys))
    }

    /// Like [`Self::describe`], with a missing table as `None`
    pub async fn describe_if_exists(
        &self,
        conn: &dyn Connection,
        table: &TableId,
    ) -> Result<Option<TableSchema>> {
        match self.describe(conn, table).await {
            Ok(schema) => Ok(Some(schema)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Schema for a table created from the source schema. Merge keys become
    /// NOT NULL primary key columns.
    pub fn derive_schema(&self, source: &SourceSchema, primary_key: &[String]) -> TableSchema {
        let columns = source
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let is_key = primary_key.iter().any(|k| k.eq_ignore_ascii_case(&col.name));
                ColumnDescriptor::new(
                    col.name.clone(),
                    self.dialect.convert_type_name(&col.logical_type),
                    col.nullable && !is_key,
                    i as u32 + 1,
                )
            })
            .collect();
        TableSchema::new(columns).with_primary_key(primary_key.to_vec())
    }

    /// Schema for the intermediate table: the source columns in source
    /// order, typed like the target's columns when the target exists
    pub fn intermediate_schema(
        &self,
        source: &SourceSchema,
        target: Option<&TableSchema>,
    ) -> Result<TableSchema> {
        let Some(target) = target else {
            return Ok(self.derive_schema(source, &[]));
        };
        let columns = source
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let existing = target.column(&col.name).ok_or_else(|| {
                    Error::schema_mismatch(format!(
                        "source column '{}' does not exist in the target table",
                        col.name
                    ))
                })?;
                // untyped columns (SQLite allows them) fall back to the source type
                let type_name = if existing.type_name.trim().is_empty() {
                    self.dialect.convert_type_name(&col.logical_type)
                } else {
                    existing.type_name.clone()
                };
                Ok(ColumnDescriptor::new(
                    existing.name.clone(),
                    type_name,
                    true,
                    i as u32 + 1,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TableSchema::new(columns))
    }

    /// Check that a live table has exactly the source columns, in order
    pub fn validate_shape(&self, source: &SourceSchema, table: &TableSchema) -> Result<()> {
        if source.len() != table.len() {
            return Err(Error::schema_mismatch(format!(
                "expected {} columns, table has {}",
                source.len(),
                table.len()
            )));
        }
        for (src, col) in source.columns.iter().zip(&table.columns) {
            if !src.name.eq_ignore_ascii_case(&col.name) {
                return Err(Error::schema_mismatch(format!(
                    "column {} is '{}', expected '{}'",
                    col.ordinal, col.name, src.name
                )));
            }
        }
        Ok(())
    }

    /// Columns of `table` to insert the source's values into, in source order
    pub fn insert_columns(
        &self,
        source: &SourceSchema,
        table: &TableSchema,
    ) -> Result<Vec<ColumnDescriptor>> {
        source
            .columns
            .iter()
            .map(|src| {
                table.column(&src.name).cloned().ok_or_else(|| {
                    Error::schema_mismatch(format!(
                        "source column '{}' does not exist in {} columns",
                        src.name,
                        table.len()
                    ))
                })
            })
            .collect()
    }

    /// Check that every source column exists in the target
    pub fn validate_target(&self, source: &SourceSchema, target: &TableSchema) -> Result<()> {
        match source
            .columns
            .iter()
            .find(|c| target.column(&c.name).is_none())
        {
            Some(missing) => Err(Error::schema_mismatch(format!(
                "source column '{}' does not exist in the target table",
                missing.name
            ))),
            None => Ok(()),
        }
    }
}

/// Check a row's arity, types and nullability against the source schema
pub fn validate_row(source: &SourceSchema, row: &[Value]) -> Result<()> {
    if row.len() != source.len() {
        return Err(Error::schema_mismatch(format!(
            "row has {} values, expected {}",
            row.len(),
            source.len()
        )));
    }
    for (col, value) in source.columns.iter().zip(row) {
        if value.is_null() {
            if !col.nullable {
                return Err(Error::schema_mismatch(format!(
                    "NULL in non-nullable column '{}'",
                    col.name
                )));
            }
        } else if !col.logical_type.accepts(value) {
            return Err(Error::schema_mismatch(format!(
                "value {:?} does not fit column '{}' of type {:?}",
                value, col.name, col.logical_type
            )));
        }
    }
    Ok(())
}

/// Group `key_name`/`column_name` rows into keys; a key with an expression
/// column (NULL name) can't match plain columns and is left out
fn unique_keys_from_rows(rows: &[Row]) -> Vec<Vec<String>> {
    let mut keys: BTreeMap<String, Option<Vec<String>>> = BTreeMap::new();
    for row in rows {
        let key = row
            .get_by_name("key_name")
            .and_then(Value::as_string)
            .unwrap_or_default();
        let column = row.get_by_name("column_name").and_then(Value::as_string);
        let entry = keys.entry(key).or_insert_with(|| Some(Vec::new()));
        match column {
            Some(column) => {
                if let Some(columns) = entry {
                    columns.push(column);
                }
            }
            None => *entry = None,
        }
    }
    keys.into_values().flatten().collect()
}

fn column_from_row(row: &Row) -> Result<ColumnDescriptor> {
    let name = row
        .get_by_name("column_name")
        .and_then(Value::as_string)
        .ok_or_else(|| Error::query("catalog row without column_name"))?;
    let type_name = row
        .get_by_name("data_type")
        .and_then(Value::as_string)
        .ok_or_else(|| Error::query(format!("no data_type for column '{}'", name)))?;
    let nullable = row
        .get_by_name("nullable")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let ordinal = row
        .get_by_name("ordinal_position")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::query(format!("no ordinal_position for column '{}'", name)))?;
    Ok(ColumnDescriptor::new(
        name,
        type_name,
        nullable,
        u32::try_from(ordinal).unwrap_or(u32::MAX),
    ))
}
