//! Attachment resolution and transfer.
//!
//! Every attachment is transferred on its own: a failure is recorded against
//! the attachment and never stops the row or the run, except for errors that
//! abort every request (rejected credentials, cancellation).

use crate::config::{CsvConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::layout::{self, TableLayout};
use crate::retry::with_retry;
use crate::session::ServerSession;
use crate::state::RowError;
use futures_util::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suitcase_protocol::{RowResource, TableSchema};
use tracing::{debug, warn};

/// Transfer state of one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentStatus {
    /// Not transferred yet.
    Pending,
    /// Transferred.
    Fetched,
    /// Already present locally with the expected size.
    Skipped,
    /// Transfer failed.
    Failed(String),
}

/// One file attached to a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    /// Row the file belongs to.
    pub row_id: String,
    /// File name from the manifest or the CSV cell.
    pub file_name: String,
    /// Download URL; empty for uploads.
    pub remote_uri: String,
    /// Path written into the CSV, relative to the table directory.
    pub local_relative_path: String,
    /// Absolute local path.
    pub local_path: PathBuf,
    /// Size announced by the server.
    pub expected_size: Option<u64>,
    /// Transfer state.
    pub status: AttachmentStatus,
}

impl AttachmentRef {
    /// Creates a reference to a local file to upload.
    pub fn for_upload(row_id: impl Into<String>, file_name: impl Into<String>, local_path: PathBuf) -> Self {
        let row_id = row_id.into();
        let file_name = file_name.into();
        Self {
            local_relative_path: layout::attachment_relative_path(&row_id, &file_name),
            row_id,
            file_name,
            remote_uri: String::new(),
            local_path,
            expected_size: None,
            status: AttachmentStatus::Pending,
        }
    }
}

/// Counts of one batch of transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferCounts {
    /// Files transferred.
    pub fetched: u64,
    /// Files left alone.
    pub skipped: u64,
    /// Files that failed.
    pub failed: u64,
    /// Bytes transferred.
    pub bytes: u64,
    /// One entry per failed file, in input order.
    pub errors: Vec<RowError>,
}

impl TransferCounts {
    fn tally(refs: &[AttachmentRef], bytes: u64) -> Self {
        let mut counts = Self {
            bytes,
            ..Self::default()
        };
        for r in refs {
            match &r.status {
                AttachmentStatus::Fetched => counts.fetched += 1,
                AttachmentStatus::Skipped => counts.skipped += 1,
                AttachmentStatus::Failed(message) => {
                    counts.failed += 1;
                    counts.errors.push(RowError::new(
                        r.row_id.clone(),
                        SyncError::attachment(r.file_name.clone(), message.clone()).to_string(),
                    ));
                }
                AttachmentStatus::Pending => {}
            }
        }
        counts
    }
}

/// Resolves attachments to local paths and transfers them with bounded
/// concurrency.
pub struct AttachmentCoordinator {
    session: Arc<dyn ServerSession>,
    config: SyncConfig,
}

impl AttachmentCoordinator {
    /// Creates a coordinator.
    pub fn new(session: Arc<dyn ServerSession>, config: SyncConfig) -> Self {
        Self { session, config }
    }

    /// Lists the attachments of a row with their local paths.
    ///
    /// Returns nothing when attachments are not included. Manifest entries
    /// with unsafe file names come back already failed.
    pub async fn resolve(
        &self,
        schema: &TableSchema,
        row: &RowResource,
        csv: &CsvConfig,
        layout: &TableLayout,
    ) -> Result<Vec<AttachmentRef>> {
        if !csv.include_attachments {
            return Ok(Vec::new());
        }

        let session = &self.session;
        let row_id = row.row_id.as_str();
        let manifest = with_retry(
            &self.config.retry,
            self.config.request_timeout,
            "fetch_attachment_manifest",
            move || session.fetch_attachment_manifest(schema, row_id),
        )
        .await?;

        Ok(manifest
            .files
            .into_iter()
            .map(|entry| {
                let (local_path, status) = match layout.attachment_path(row_id, &entry.filename) {
                    Ok(path) => (path, AttachmentStatus::Pending),
                    Err(_) => (PathBuf::new(), AttachmentStatus::Failed("unsafe file name".into())),
                };
                AttachmentRef {
                    row_id: row_id.to_string(),
                    local_relative_path: layout::attachment_relative_path(row_id, &entry.filename),
                    file_name: entry.filename,
                    remote_uri: entry.download_url,
                    local_path,
                    expected_size: entry.content_length,
                    status,
                }
            })
            .collect())
    }

    /// Downloads every pending attachment. Returns once all transfers have
    /// settled.
    pub async fn fetch_all(&self, refs: &mut [AttachmentRef]) -> Result<TransferCounts> {
        let settled: Vec<(usize, Result<(AttachmentStatus, u64)>)> = stream::iter(pending(refs))
            .map(|(index, r)| async move { (index, self.fetch_one(&r).await) })
            .buffer_unordered(self.config.max_concurrent_transfers.max(1))
            .collect()
            .await;

        let bytes = self.settle(refs, settled)?;
        Ok(TransferCounts::tally(refs, bytes))
    }

    /// Uploads every pending attachment of an accepted row batch.
    pub async fn upload_all(
        &self,
        schema: &TableSchema,
        refs: &mut [AttachmentRef],
    ) -> Result<TransferCounts> {
        let settled: Vec<(usize, Result<(AttachmentStatus, u64)>)> = stream::iter(pending(refs))
            .map(|(index, r)| async move { (index, self.upload_one(schema, &r).await) })
            .buffer_unordered(self.config.max_concurrent_transfers.max(1))
            .collect()
            .await;

        let bytes = self.settle(refs, settled)?;
        Ok(TransferCounts::tally(refs, bytes))
    }

    fn settle(
        &self,
        refs: &mut [AttachmentRef],
        mut settled: Vec<(usize, Result<(AttachmentStatus, u64)>)>,
    ) -> Result<u64> {
        settled.sort_by_key(|(index, _)| *index);
        let mut bytes = 0;
        for (index, outcome) in settled {
            let r = &mut refs[index];
            match outcome {
                Ok((status, n)) => {
                    bytes += n;
                    r.status = status;
                }
                Err(e) if e.aborts_run() => return Err(e),
                Err(e) => {
                    warn!(row_id = %r.row_id, file = %r.file_name, error = %e, "attachment transfer failed");
                    let message = match e {
                        SyncError::Attachment { message, .. } => message,
                        other => other.to_string(),
                    };
                    r.status = AttachmentStatus::Failed(message);
                }
            }
        }
        Ok(bytes)
    }

    async fn fetch_one(&self, r: &AttachmentRef) -> Result<(AttachmentStatus, u64)> {
        if !self.config.refetch_attachments && is_present(&r.local_path, r.expected_size).await {
            debug!(path = %r.local_path.display(), "attachment already present");
            return Ok((AttachmentStatus::Skipped, 0));
        }

        let session = &self.session;
        let url = r.remote_uri.as_str();
        let content = with_retry(
            &self.config.retry,
            self.config.request_timeout,
            "download_attachment",
            move || session.download_attachment(url),
        )
        .await?;

        if let Some(expected) = r.expected_size {
            if content.len() as u64 != expected {
                return Err(SyncError::attachment(
                    r.file_name.clone(),
                    format!("expected {expected} bytes, got {}", content.len()),
                ));
            }
        }

        write_atomically(&r.local_path, &content).await?;
        debug!(path = %r.local_path.display(), bytes = content.len(), "attachment fetched");
        Ok((AttachmentStatus::Fetched, content.len() as u64))
    }

    async fn upload_one(&self, schema: &TableSchema, r: &AttachmentRef) -> Result<(AttachmentStatus, u64)> {
        let content = tokio::fs::read(&r.local_path).await.map_err(|e| {
            SyncError::attachment(r.file_name.clone(), format!("{}: {e}", r.local_path.display()))
        })?;
        let bytes = content.len() as u64;

        let session = &self.session;
        let (row_id, file_name) = (r.row_id.as_str(), r.file_name.as_str());
        with_retry(
            &self.config.retry,
            self.config.request_timeout,
            "upload_attachment",
            move || session.upload_attachment(schema, row_id, file_name, content.clone()),
        )
        .await?;

        debug!(row_id, file = file_name, bytes, "attachment uploaded");
        Ok((AttachmentStatus::Fetched, bytes))
    }
}

/// Owned copies of the pending references with their positions.
fn pending(refs: &[AttachmentRef]) -> Vec<(usize, AttachmentRef)> {
    refs.iter()
        .enumerate()
        .filter(|(_, r)| r.status == AttachmentStatus::Pending)
        .map(|(index, r)| (index, r.clone()))
        .collect()
}

async fn is_present(path: &Path, expected_size: Option<u64>) -> bool {
    match (tokio::fs::metadata(path).await, expected_size) {
        (Ok(meta), Some(expected)) => meta.is_file() && meta.len() == expected,
        _ => false,
    }
}

async fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, content).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(())
}
