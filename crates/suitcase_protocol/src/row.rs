//! Row resources, pages and upload outcomes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row metadata maintained by the server alongside the row data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowMetadata {
    /// Form used to author the last revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    /// Locale of the last revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// `COMPLETE` or `INCOMPLETE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint_type: Option<String>,
    /// Timestamp of the last save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint_timestamp: Option<String>,
    /// User that performed the last save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint_creator: Option<String>,
    /// User that created the row on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_user: Option<String>,
    /// User that last modified the row on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_user: Option<String>,
    /// Revision tag of the row.
    #[serde(rename = "rowETag", default, skip_serializing_if = "Option::is_none")]
    pub row_etag: Option<String>,
}

impl RowMetadata {
    /// CSV column names of the metadata fields, in their fixed output order.
    pub const COLUMNS: [&'static str; 8] = [
        "_form_id",
        "_locale",
        "_savepoint_type",
        "_savepoint_timestamp",
        "_savepoint_creator",
        "_create_user",
        "_last_update_user",
        "_row_etag",
    ];

    /// Returns the value of a metadata field by its CSV column name.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.slot(column).and_then(|slot| slot.as_deref())
    }

    /// Sets a metadata field by its CSV column name. Empty values clear it.
    ///
    /// Returns false if `column` is not a metadata column.
    pub fn set(&mut self, column: &str, value: &str) -> bool {
        match self.slot_mut(column) {
            Some(slot) => {
                *slot = (!value.is_empty()).then(|| value.to_string());
                true
            }
            None => false,
        }
    }

    fn slot(&self, column: &str) -> Option<&Option<String>> {
        Some(match column {
            "_form_id" => &self.form_id,
            "_locale" => &self.locale,
            "_savepoint_type" => &self.savepoint_type,
            "_savepoint_timestamp" => &self.savepoint_timestamp,
            "_savepoint_creator" => &self.savepoint_creator,
            "_create_user" => &self.create_user,
            "_last_update_user" => &self.last_update_user,
            "_row_etag" => &self.row_etag,
            _ => return None,
        })
    }

    fn slot_mut(&mut self, column: &str) -> Option<&mut Option<String>> {
        Some(match column {
            "_form_id" => &mut self.form_id,
            "_locale" => &mut self.locale,
            "_savepoint_type" => &mut self.savepoint_type,
            "_savepoint_timestamp" => &mut self.savepoint_timestamp,
            "_savepoint_creator" => &mut self.savepoint_creator,
            "_create_user" => &mut self.create_user,
            "_last_update_user" => &mut self.last_update_user,
            "_row_etag" => &mut self.row_etag,
            _ => return None,
        })
    }
}

/// A single table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowResource {
    /// Row identifier.
    pub row_id: String,
    /// Server-maintained metadata.
    #[serde(flatten)]
    pub metadata: RowMetadata,
    /// Whether the row is a tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Row data keyed by top-level element key; may nest objects.
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl RowResource {
    /// Creates a row with no metadata.
    pub fn new(row_id: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            row_id: row_id.into(),
            metadata: RowMetadata::default(),
            deleted: false,
            values,
        }
    }
}

/// One page of rows with its continuation cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPage {
    /// Rows in server order.
    #[serde(default)]
    pub rows: Vec<RowResource>,
    /// Opaque cursor to resume after this page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_safe_resume_cursor: Option<String>,
    /// Whether more rows follow.
    #[serde(default)]
    pub has_more_results: bool,
}

impl RowPage {
    /// Creates a page.
    pub fn new(rows: Vec<RowResource>, next_cursor: Option<String>) -> Self {
        Self {
            rows,
            has_more_results: next_cursor.is_some(),
            web_safe_resume_cursor: next_cursor,
        }
    }

    /// Cursor of the next page, or `None` at end of stream.
    ///
    /// A page that claims more results but carries no (or an empty) cursor is
    /// treated as the last page.
    pub fn next_cursor(&self) -> Option<&str> {
        if !self.has_more_results {
            return None;
        }
        self.web_safe_resume_cursor
            .as_deref()
            .filter(|cursor| !cursor.is_empty())
    }
}

/// `PUT .../rows` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterRowsRequest {
    /// Rows to insert or update.
    pub rows: Vec<RowResource>,
    /// Data version the client believes is current.
    pub data_version: String,
}

/// Per-row result of an alter-rows request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Row was applied.
    Success,
    /// Caller lacks permission to modify the row.
    Denied,
    /// Row was modified by another writer.
    InConflict,
    /// Row failed for another reason.
    Failed,
    /// Outcome code this client does not know.
    #[serde(other)]
    Unknown,
}

/// Outcome for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome {
    /// Row identifier.
    pub row_id: String,
    /// Result code.
    pub outcome: Outcome,
    /// Optional server message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `PUT .../rows` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcomeList {
    /// One entry per submitted row.
    #[serde(default)]
    pub rows: Vec<RowOutcome>,
}
