use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SqlDispatchError;
use crate::types::{Row, RowValues};

/// Schema name to the object names it contains, in the order the backend listed them.
pub type Schema = BTreeMap<String, Vec<String>>;

/// Kind of a node in a [`Structure`] tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StructureType {
    /// Grouping node, e.g. a schema.
    #[default]
    None,
    Table,
    View,
    MaterializedView,
}

impl StructureType {
    /// Map a backend's object-kind label onto a structure type.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "table" | "base table" | "base_table" | "foreign table" => StructureType::Table,
            "view" => StructureType::View,
            "materialized view" | "materialized_view" | "matview" => {
                StructureType::MaterializedView
            }
            _ => StructureType::None,
        }
    }
}

/// Hierarchical catalog node: schemas at the top, their objects as children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub name: String,
    pub schema: String,
    pub kind: StructureType,
    pub children: Vec<Structure>,
}

/// A column of a table or view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Declared type, spelled the way the backend reports it.
    #[serde(rename = "type")]
    pub r#type: String,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>, r#type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type: r#type.into(),
        }
    }
}

/// Which object to introspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    pub schema: String,
    pub table: String,
    pub materialization: StructureType,
}

impl TableOptions {
    #[must_use]
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            materialization: StructureType::Table,
        }
    }
}

/// Quote a value as a SQL string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn text_at(row: &Row, idx: usize, what: &str) -> Result<String, SqlDispatchError> {
    match row.get(idx) {
        Some(RowValues::Text(s)) => Ok(s.clone()),
        Some(RowValues::Null) => Ok(String::new()),
        Some(other) => Err(SqlDispatchError::SchemaError(format!(
            "expected text for {what}, got {other:?}"
        ))),
        None => Err(SqlDispatchError::SchemaError(format!(
            "introspection row is missing the {what} column"
        ))),
    }
}

/// Fold `(schema, object)` rows into a [`Schema`].
///
/// # Errors
/// Returns `SqlDispatchError::SchemaError` if a row does not hold two text values.
pub fn fold_schema(rows: &[Row]) -> Result<Schema, SqlDispatchError> {
    let mut schema = Schema::new();
    for row in rows {
        let key = text_at(row, 0, "schema")?;
        let object = text_at(row, 1, "object")?;
        schema.entry(key).or_default().push(object);
    }
    Ok(schema)
}

/// Fold `(name, type)` rows into columns.
///
/// # Errors
/// Returns `SqlDispatchError::SchemaError` for malformed rows.
pub fn fold_columns(rows: &[Row]) -> Result<Vec<Column>, SqlDispatchError> {
    rows.iter()
        .map(|row| Ok(Column::new(text_at(row, 0, "name")?, text_at(row, 1, "type")?)))
        .collect()
}

/// Fold `(schema, name, kind)` rows into one node per schema.
///
/// Schemas appear in first-seen order, their children in row order.
///
/// # Errors
/// Returns `SqlDispatchError::SchemaError` for malformed rows.
pub fn fold_structure(rows: &[Row]) -> Result<Vec<Structure>, SqlDispatchError> {
    let mut nodes: Vec<Structure> = Vec::new();
    for row in rows {
        let schema = text_at(row, 0, "schema")?;
        let name = text_at(row, 1, "name")?;
        let kind = StructureType::from_label(&text_at(row, 2, "kind")?);

        let idx = match nodes.iter().position(|n| n.name == schema) {
            Some(idx) => idx,
            None => {
                nodes.push(Structure {
                    name: schema.clone(),
                    schema: schema.clone(),
                    kind: StructureType::None,
                    children: Vec::new(),
                });
                nodes.len() - 1
            }
        };
        nodes[idx].children.push(Structure {
            name,
            schema,
            kind,
            children: Vec::new(),
        });
    }
    Ok(nodes)
}
