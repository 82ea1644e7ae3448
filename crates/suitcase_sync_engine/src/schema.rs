//! Mapping between the server's column tree and flat CSV columns.
//!
//! Nested object columns are flattened depth-first in server order, with
//! keys joined by `.`. The first column is always `_id`; the metadata
//! columns of [`RowMetadata::COLUMNS`] trail the data columns when
//! requested. The same schema and configuration always produce the same
//! column list.

use crate::config::CsvConfig;
use crate::error::{Result, SyncError};
use crate::layout;
use csv::StringRecord;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use suitcase_protocol::{ColumnDefinition, ColumnType, RowMetadata, RowResource, TableSchema};

/// Name of the row identifier column.
pub const ROW_ID_COLUMN: &str = "_id";

/// Separator between the keys of a nested column path.
pub const PATH_SEPARATOR: char = '.';

/// Substitutions applied, in order, to every cell when Scan formatting is on.
///
/// Scan reads one logical line per record and treats `"` as a field
/// delimiter, so line breaks and tabs collapse to a space and double quotes
/// become single quotes.
pub const SCAN_SUBSTITUTIONS: [(&str, &str); 5] = [
    ("\r\n", " "),
    ("\n", " "),
    ("\r", " "),
    ("\t", " "),
    ("\"", "'"),
];

/// Where the value of a CSV column comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// The row identifier.
    RowId,
    /// A leaf of the column tree.
    Data {
        /// Keys from the top-level column down to the leaf.
        path: Vec<String>,
        /// Type of the leaf.
        column_type: ColumnType,
    },
    /// A row metadata field.
    Metadata,
}

/// One CSV column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatColumn {
    /// Header name.
    pub name: String,
    /// Value source.
    pub source: ColumnSource,
}

impl FlatColumn {
    /// Returns true if the column holds attachment references.
    pub fn is_attachment(&self) -> bool {
        matches!(
            &self.source,
            ColumnSource::Data { column_type, .. } if column_type.is_attachment()
        )
    }
}

/// Flattens a schema into the ordered CSV column list.
pub fn flatten(schema: &TableSchema, config: &CsvConfig) -> Vec<FlatColumn> {
    let mut columns = vec![FlatColumn {
        name: ROW_ID_COLUMN.to_string(),
        source: ColumnSource::RowId,
    }];
    let mut path = Vec::new();
    flatten_level(&schema.columns, &mut path, &mut columns);

    if config.extra_metadata_columns {
        columns.extend(RowMetadata::COLUMNS.iter().map(|name| FlatColumn {
            name: (*name).to_string(),
            source: ColumnSource::Metadata,
        }));
    }
    columns
}

fn flatten_level(level: &[ColumnDefinition], path: &mut Vec<String>, out: &mut Vec<FlatColumn>) {
    for column in level {
        path.push(column.element_key.clone());
        if column.is_group() {
            flatten_level(&column.child_elements, path, out);
        } else {
            out.push(FlatColumn {
                name: path.join(&PATH_SEPARATOR.to_string()),
                source: ColumnSource::Data {
                    path: path.clone(),
                    column_type: column.element_type,
                },
            });
        }
        path.pop();
    }
}

/// Header names of a column list.
pub fn header(columns: &[FlatColumn]) -> Vec<&str> {
    columns.iter().map(|c| c.name.as_str()).collect()
}

/// Maps a row onto the column list. Missing values become empty cells.
pub fn map_row(row: &RowResource, columns: &[FlatColumn], config: &CsvConfig) -> Vec<String> {
    columns
        .iter()
        .map(|column| {
            let cell = match &column.source {
                ColumnSource::RowId => row.row_id.clone(),
                ColumnSource::Metadata => row.metadata.get(&column.name).unwrap_or_default().to_string(),
                ColumnSource::Data { path, column_type } => match lookup(&row.values, path) {
                    None | Some(Value::Null) => String::new(),
                    Some(value) if column_type.is_attachment() && config.include_attachments => {
                        attachment_name(value)
                            .map(|name| layout::attachment_relative_path(&row.row_id, name))
                            .unwrap_or_default()
                    }
                    Some(value) => cell_text(value, config.scan_formatting),
                },
            };
            if config.scan_formatting {
                scan_format(&cell)
            } else {
                cell
            }
        })
        .collect()
}

/// File name referenced by an attachment cell value.
///
/// Accepts a plain string or an object carrying `uriFragment`.
pub fn attachment_name(value: &Value) -> Option<&str> {
    let name = match value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("uriFragment")?.as_str()?,
        _ => return None,
    };
    (!name.is_empty()).then_some(name)
}

/// Applies [`SCAN_SUBSTITUTIONS`] to a cell.
pub fn scan_format(cell: &str) -> String {
    SCAN_SUBSTITUTIONS
        .iter()
        .fold(cell.to_string(), |acc, (from, to)| acc.replace(from, to))
}

fn lookup<'a>(values: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    values
        .get(first)
        .and_then(|top| rest.iter().try_fold(top, |value, key| value.get(key)))
        .or_else(|| values.get(&path.join(&PATH_SEPARATOR.to_string())))
}

fn cell_text(value: &Value, scan: bool) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) if scan => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Resolves a CSV header against the column list.
///
/// Returns, per header position, the index of the matching column. Unknown
/// or repeated names are a schema mismatch.
pub fn check_header(header: &StringRecord, columns: &[FlatColumn]) -> Result<Vec<usize>> {
    let by_name: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();
    let mut seen = vec![false; columns.len()];

    header
        .iter()
        .map(|name| {
            let index = *by_name
                .get(name)
                .ok_or_else(|| SyncError::Schema(format!("column '{name}' is not in the table schema")))?;
            if std::mem::replace(&mut seen[index], true) {
                return Err(SyncError::Schema(format!("column '{name}' appears twice")));
            }
            Ok(index)
        })
        .collect()
}

/// Rebuilds a row from a CSV record.
///
/// `mapping` comes from [`check_header`]. Rows without an `_id` cell get a
/// fresh `uuid:` identifier. Empty cells are left out of the row values.
pub fn unmap_row(
    record: &StringRecord,
    mapping: &[usize],
    columns: &[FlatColumn],
) -> std::result::Result<RowResource, String> {
    let mut row = RowResource::new(String::new(), Map::new());

    for (cell, &index) in record.iter().zip(mapping) {
        let column = &columns[index];
        match &column.source {
            ColumnSource::RowId => row.row_id = cell.to_string(),
            ColumnSource::Metadata => {
                row.metadata.set(&column.name, cell);
            }
            ColumnSource::Data { path, column_type } => {
                if cell.is_empty() {
                    continue;
                }
                let value = parse_cell(cell, *column_type)
                    .map_err(|e| format!("column '{}': {e}", column.name))?;
                insert_path(&mut row.values, path, value)
                    .map_err(|e| format!("column '{}': {e}", column.name))?;
            }
        }
    }

    if row.row_id.is_empty() {
        row.row_id = format!("uuid:{}", uuid::Uuid::new_v4());
    }
    Ok(row)
}

fn parse_cell(cell: &str, column_type: ColumnType) -> std::result::Result<Value, String> {
    match column_type {
        ColumnType::Integer => cell
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("'{cell}' is not an integer")),
        ColumnType::Number => cell
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("'{cell}' is not a number")),
        ColumnType::Boolean => match cell.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("'{cell}' is not a boolean")),
        },
        ColumnType::Array => match serde_json::from_str(cell) {
            Ok(value @ Value::Array(_)) => Ok(value),
            _ => Err(format!("'{cell}' is not a JSON array")),
        },
        ColumnType::Object => match serde_json::from_str(cell) {
            Ok(value @ Value::Object(_)) => Ok(value),
            _ => Err(format!("'{cell}' is not a JSON object")),
        },
        ColumnType::Rowpath => Ok(Value::String(layout::file_name_of(cell).to_string())),
        ColumnType::String | ColumnType::Configpath | ColumnType::Other => {
            Ok(Value::String(cell.to_string()))
        }
    }
}

fn insert_path(
    values: &mut Map<String, Value>,
    path: &[String],
    value: Value,
) -> std::result::Result<(), String> {
    let Some((last, parents)) = path.split_last() else {
        return Err("empty column path".into());
    };
    let mut current = values;
    for key in parents {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| format!("'{key}' is not an object"))?;
    }
    current.insert(last.clone(), value);
    Ok(())
}
