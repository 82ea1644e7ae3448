//! Local file layout of a table.
//!
//! ```text
//! <root>/<appId>/<tableId>/<tableId>.csv
//! <root>/<appId>/<tableId>/instances/<encodedRowId>/<fileName>
//! ```

use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};

/// Directory holding per-row attachment folders.
pub const INSTANCES_DIR: &str = "instances";

/// Paths of one table's local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    table_dir: PathBuf,
    csv_path: PathBuf,
}

impl TableLayout {
    /// Layout rooted at `root`.
    pub fn new(root: &Path, app_id: &str, table_id: &str) -> Self {
        let table_dir = root.join(safe_segment(app_id)).join(safe_segment(table_id));
        let csv_path = table_dir.join(format!("{}.csv", safe_segment(table_id)));
        Self { table_dir, csv_path }
    }

    /// Layout for an upload source: either an explicit `.csv` file, whose
    /// directory then holds `instances/`, or a root directory.
    pub fn for_input(input: &Path, app_id: &str, table_id: &str) -> Self {
        let is_csv = input
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv {
            let table_dir = input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            Self {
                table_dir,
                csv_path: input.to_path_buf(),
            }
        } else {
            Self::new(input, app_id, table_id)
        }
    }

    /// Directory of the table.
    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    /// CSV file of the table.
    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Absolute location of an attachment.
    pub fn attachment_path(&self, row_id: &str, file_name: &str) -> Result<PathBuf> {
        check_file_name(file_name)?;
        Ok(self
            .table_dir
            .join(INSTANCES_DIR)
            .join(safe_segment(row_id))
            .join(file_name))
    }

    /// Resolves the attachment cell of `row_id` to a local file.
    ///
    /// A cell is either a bare file name or `instances/<safeRowId>/<file>`
    /// naming the row's own folder. Anything else, absolute paths and `..`
    /// included, is rejected.
    pub fn resolve_cell(&self, row_id: &str, cell: &str) -> Result<PathBuf> {
        let parts: Vec<&str> = cell.split(['/', '\\']).collect();
        match parts.as_slice() {
            [file_name] => self.attachment_path(row_id, file_name),
            [INSTANCES_DIR, folder, file_name] if *folder == safe_segment(row_id) => {
                self.attachment_path(row_id, file_name)
            }
            _ => Err(SyncError::attachment(
                file_name_of(cell),
                format!("'{cell}' is outside {INSTANCES_DIR}/{}", safe_segment(row_id)),
            )),
        }
    }
}

/// Encodes an identifier as a single path segment.
///
/// `[A-Za-z0-9._-]` pass through; every other byte, `%` included, becomes
/// `%XX`. Dots are encoded too when the segment is made only of dots, and an
/// empty identifier becomes `%`. Distinct identifiers never share a segment.
pub fn safe_segment(segment: &str) -> String {
    if segment.is_empty() {
        return "%".to_string();
    }
    let only_dots = segment.bytes().all(|b| b == b'.');
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(byte, b'_' | b'-')
            || (byte == b'.' && !only_dots);
        if plain {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// Path written into the CSV for an attachment, relative to the table directory.
pub fn attachment_relative_path(row_id: &str, file_name: &str) -> String {
    format!("{INSTANCES_DIR}/{}/{file_name}", safe_segment(row_id))
}

/// Last path segment of an attachment cell.
pub fn file_name_of(cell: &str) -> &str {
    cell.rsplit(['/', '\\']).next().unwrap_or(cell)
}

/// Rejects file names that would escape the row folder.
pub fn check_file_name(file_name: &str) -> Result<()> {
    let bad = file_name.is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\', ':', '\0']);
    if bad {
        Err(SyncError::attachment(file_name, "unsafe file name"))
    } else {
        Ok(())
    }
}
