//! # Suitcase Sync Engine
//!
//! Synchronizes tables of an ODK-X Aggregate server with local CSV files and
//! attachment folders.
//!
//! This crate provides:
//! - Paginated download of a table into a flat CSV, with optional attachment
//!   files, Scan formatting and metadata columns
//! - Upload of a local CSV (and the attachments it names) in bounded batches
//! - Table reset
//! - A data-version gate that rejects stale uploads and resets
//! - Retry with exponential backoff and per-request timeouts
//! - Cancellable tasks with progress reporting
//!
//! ## Architecture
//!
//! A [`ServerSession`] talks to the server ([`HttpSession`] over HTTP,
//! [`MockSession`] in memory). The [`RowSyncEngine`] drives one run through
//! `Init -> SchemaFetched -> Paging -> Flushing -> Done`, mapping rows with
//! the schema mapper and handing attachments to the
//! [`AttachmentCoordinator`]. A [`TaskRunner`] wraps each operation with
//! cancellation and progress.
//!
//! ## Key Invariants
//!
//! - Rows reach the CSV in server order, one page at a time
//! - A page is written only after all of its attachment transfers settled
//! - A failed attachment never aborts its row or the run
//! - No row is posted and nothing is reset unless the supplied data version
//!   is the server's current one

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachments;
mod config;
mod connection;
mod engine;
mod error;
mod http;
mod layout;
mod mock;
mod retry;
mod schema;
mod session;
mod state;
mod task;
mod validate;
mod version;

pub use attachments::{AttachmentCoordinator, AttachmentRef, AttachmentStatus, TransferCounts};
pub use config::{CsvConfig, RetryConfig, SyncConfig, MAX_CONCURRENT_TRANSFERS};
pub use connection::{Credentials, ServerConnection};
pub use engine::RowSyncEngine;
pub use error::{Result, SyncError};
pub use http::HttpSession;
pub use layout::{safe_segment, TableLayout, INSTANCES_DIR};
pub use mock::{MockOp, MockSession, PostedBatch, UploadedFile};
pub use schema::{
    flatten, map_row, scan_format, ColumnSource, FlatColumn, PATH_SEPARATOR, ROW_ID_COLUMN,
    SCAN_SUBSTITUTIONS,
};
pub use session::ServerSession;
pub use state::{Progress, RowError, SyncResult, SyncState, TaskOutcome};
pub use task::{
    CancelHandle, DownloadParams, Operation, OperationKind, ProgressListener, ResetParams, Task,
    TaskRunner, UploadParams,
};
pub use validate::{
    check_download_fields, check_login_fields, check_reset_fields, check_upload_fields,
    default_download_dir, default_upload_dir,
};
pub use version::VersionGate;

use std::path::Path;
use std::sync::Arc;

fn runner(connection: &ServerConnection, config: &SyncConfig) -> Result<TaskRunner> {
    let session = HttpSession::new(connection.clone(), config.request_timeout)?;
    Ok(TaskRunner::new(Arc::new(session), config.clone()))
}

/// Downloads `table_id` into `<output>/<appId>/<tableId>/`.
///
/// `output` defaults to `./Download`.
pub async fn run_download(
    connection: &ServerConnection,
    table_id: &str,
    csv: CsvConfig,
    output: Option<&Path>,
    config: &SyncConfig,
) -> Result<SyncResult> {
    let params = DownloadParams::new(table_id, csv, output)?;
    runner(connection, config)?.run(&params).await?.into_result()
}

/// Uploads a local CSV to `table_id`.
///
/// `input` is a `.csv` file or a root laid out like a download; it defaults
/// to `./Upload`.
pub async fn run_upload(
    connection: &ServerConnection,
    table_id: &str,
    input: Option<&Path>,
    data_version: Option<&str>,
    config: &SyncConfig,
) -> Result<SyncResult> {
    let params = UploadParams::new(table_id, input, data_version)?;
    runner(connection, config)?.run(&params).await?.into_result()
}

/// Deletes every row of `table_id`.
pub async fn run_reset(
    connection: &ServerConnection,
    table_id: &str,
    data_version: Option<&str>,
    config: &SyncConfig,
) -> Result<SyncResult> {
    let params = ResetParams::new(table_id, data_version)?;
    runner(connection, config)?.run(&params).await?.into_result()
}
