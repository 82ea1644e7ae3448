//! Table metadata: resource, column definitions and the derived schema.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Element type of a column as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnType {
    /// Free text.
    String,
    /// Whole number.
    Integer,
    /// Floating point number.
    Number,
    /// `true` / `false`.
    Boolean,
    /// JSON array, stored in a single cell.
    Array,
    /// JSON object; flattened when it declares child elements.
    Object,
    /// Reference to a file attached to the row.
    Rowpath,
    /// Reference to an application configuration file.
    Configpath,
    /// Any element type this client does not interpret. Treated as text.
    #[serde(other)]
    Other,
}

impl ColumnType {
    /// Returns true if values of this type name an attachment file.
    pub fn is_attachment(&self) -> bool {
        matches!(self, ColumnType::Rowpath)
    }
}

/// A column in the server's table definition.
///
/// Object columns may carry child elements; the tree is flattened into dotted
/// paths by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    /// Key of the element within its parent.
    pub element_key: String,
    /// Element type.
    pub element_type: ColumnType,
    /// Nested elements (only meaningful for `Object`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_elements: Vec<ColumnDefinition>,
}

impl ColumnDefinition {
    /// Creates a leaf column.
    pub fn leaf(element_key: impl Into<String>, element_type: ColumnType) -> Self {
        Self {
            element_key: element_key.into(),
            element_type,
            child_elements: Vec::new(),
        }
    }

    /// Creates an object column with the given children.
    pub fn object(element_key: impl Into<String>, children: Vec<ColumnDefinition>) -> Self {
        Self {
            element_key: element_key.into(),
            element_type: ColumnType::Object,
            child_elements: children,
        }
    }

    /// Returns true if this column is flattened into its children.
    pub fn is_group(&self) -> bool {
        self.element_type == ColumnType::Object && !self.child_elements.is_empty()
    }
}

/// `GET {base}/{appId}/tables/{tableId}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableResource {
    /// Table identifier.
    pub table_id: String,
    /// Identifies the current schema revision.
    #[serde(rename = "schemaETag")]
    pub schema_etag: String,
    /// Current data version (table generation).
    pub data_version: String,
}

/// `GET .../ref/{schemaETag}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Top-level columns in server order.
    pub ordered_columns: Vec<ColumnDefinition>,
}

/// Table schema for one sync run: resource identity plus validated columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    /// Table identifier.
    pub table_id: String,
    /// Schema revision the row endpoints are addressed with.
    pub schema_etag: String,
    /// Data version reported by the server when the schema was fetched.
    pub data_version: String,
    /// Column tree in server order.
    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    /// Combines a table resource and its definition, validating the column tree.
    ///
    /// Keys must be non-empty, must not contain `.` (the path separator), must
    /// not start with `_` (reserved for metadata columns) and must be unique
    /// among siblings.
    pub fn from_parts(resource: TableResource, definition: TableDefinition) -> ProtocolResult<Self> {
        if resource.schema_etag.is_empty() {
            return Err(ProtocolError::invalid_structure("empty schemaETag"));
        }
        validate_level(&definition.ordered_columns, "")?;

        Ok(Self {
            table_id: resource.table_id,
            schema_etag: resource.schema_etag,
            data_version: resource.data_version,
            columns: definition.ordered_columns,
        })
    }
}

fn validate_level(columns: &[ColumnDefinition], parent: &str) -> ProtocolResult<()> {
    let mut seen = HashSet::new();
    for column in columns {
        let key = column.element_key.as_str();
        if key.is_empty() {
            return Err(ProtocolError::invalid_structure(format!(
                "empty element key under '{parent}'"
            )));
        }
        if key.contains('.') {
            return Err(ProtocolError::invalid_structure(format!(
                "element key '{key}' contains '.'"
            )));
        }
        if key.starts_with('_') {
            return Err(ProtocolError::invalid_structure(format!(
                "element key '{key}' uses the reserved '_' prefix"
            )));
        }
        if !seen.insert(key) {
            return Err(ProtocolError::invalid_structure(format!(
                "duplicate element key '{key}' under '{parent}'"
            )));
        }
        if column.is_group() {
            let path = if parent.is_empty() {
                key.to_string()
            } else {
                format!("{parent}.{key}")
            };
            validate_level(&column.child_elements, &path)?;
        }
    }
    Ok(())
}
