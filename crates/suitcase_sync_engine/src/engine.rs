//! Row sync engine: download, upload and reset of one table.

use crate::attachments::{AttachmentCoordinator, AttachmentRef, TransferCounts};
use crate::config::{CsvConfig, RetryConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::layout::{self, TableLayout};
use crate::retry::with_retry;
use crate::schema::{self, FlatColumn};
use crate::session::ServerSession;
use crate::state::{Progress, RowError, SyncResult, SyncState, TaskOutcome};
use crate::task::{CancelHandle, ProgressListener};
use crate::version::VersionGate;
use csv::StringRecord;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use suitcase_protocol::{Outcome, RowOutcome, RowResource, TableSchema};
use tracing::{debug, error, info, instrument, warn};

/// A row read back from the CSV with the attachments it names.
struct PendingRow {
    row: RowResource,
    attachments: Vec<AttachmentRef>,
    size: usize,
}

/// Runs download, upload and reset for tables of one app.
///
/// Rows are processed strictly in order; only attachment transfers within
/// a page run concurrently. Cancellation is checked before each page fetch
/// and each upload batch.
pub struct RowSyncEngine {
    session: Arc<dyn ServerSession>,
    config: SyncConfig,
    attachments: AttachmentCoordinator,
    state: RwLock<SyncState>,
    cancel: CancelHandle,
    listener: Option<Arc<dyn ProgressListener>>,
}

impl RowSyncEngine {
    /// Creates an engine.
    pub fn new(session: Arc<dyn ServerSession>, config: SyncConfig) -> Self {
        Self {
            attachments: AttachmentCoordinator::new(session.clone(), config.clone()),
            session,
            config,
            state: RwLock::new(SyncState::Init),
            cancel: CancelHandle::new(),
            listener: None,
        }
    }

    /// Uses `cancel` as the cancellation signal.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reports progress to `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Handle that cancels the running operation.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn set_state(&self, next: SyncState) -> Result<()> {
        let mut state = self.state.write();
        *state = state.transition(next)?;
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state != SyncState::Init && !state.is_terminal() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: "Init".into(),
            });
        }
        *state = SyncState::Init;
        Ok(())
    }

    fn finish(&self, outcome: Result<TaskOutcome>) -> Result<TaskOutcome> {
        match outcome {
            Ok(outcome) => {
                let result = outcome.result();
                info!(
                    state = %self.state(),
                    rows = result.rows_processed,
                    attachments_fetched = result.attachments_fetched,
                    attachments_failed = result.attachments_failed,
                    errors = result.errors.len(),
                    "sync finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                *self.state.write() = SyncState::Failed;
                error!(error = %e, "sync failed");
                Err(e)
            }
        }
    }

    fn report(&self, pages: u64, result: &SyncResult) {
        if let Some(listener) = &self.listener {
            listener.on_progress(&Progress::snapshot(self.state(), pages, result));
        }
    }

    fn cancelled(&self, result: SyncResult) -> Result<TaskOutcome> {
        self.set_state(SyncState::Cancelled)?;
        info!(rows = result.rows_processed, "sync cancelled");
        Ok(TaskOutcome::Cancelled(result))
    }

    async fn fetch_schema(&self, table_id: &str) -> Result<TableSchema> {
        let session = &self.session;
        let schema = with_retry(
            &self.config.retry,
            self.config.request_timeout,
            "fetch_schema",
            move || session.fetch_schema(table_id),
        )
        .await?;
        self.set_state(SyncState::SchemaFetched)?;
        debug!(
            schema_etag = %schema.schema_etag,
            data_version = %schema.data_version,
            columns = schema.columns.len(),
            "schema fetched"
        );
        Ok(schema)
    }

    /// Downloads every row of `table_id` into
    /// `<output_root>/<appId>/<tableId>/<tableId>.csv`.
    #[instrument(skip(self, csv_config, output_root), fields(app_id = %self.session.app_id()))]
    pub async fn download(
        &self,
        table_id: &str,
        csv_config: &CsvConfig,
        output_root: &Path,
    ) -> Result<TaskOutcome> {
        self.begin()?;
        let outcome = self.run_download(table_id, csv_config, output_root).await;
        self.finish(outcome)
    }

    async fn run_download(
        &self,
        table_id: &str,
        csv_config: &CsvConfig,
        output_root: &Path,
    ) -> Result<TaskOutcome> {
        let schema = self.fetch_schema(table_id).await?;
        let columns = schema::flatten(&schema, csv_config);

        let layout = TableLayout::new(output_root, self.session.app_id(), table_id);
        if tokio::fs::try_exists(layout.csv_path()).await? && !self.config.force_overwrite {
            return Err(SyncError::OutputExists(layout.csv_path().to_path_buf()));
        }
        tokio::fs::create_dir_all(layout.table_dir()).await?;
        let file = tokio::fs::File::create(layout.csv_path()).await?.into_std().await;
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(file);
        writer.write_record(schema::header(&columns))?;
        writer.flush()?;
        info!(path = %layout.csv_path().display(), columns = columns.len(), "writing csv");

        self.set_state(SyncState::Paging)?;
        let mut result = SyncResult::default();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();
        let mut pages = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled(result);
            }

            let session = &self.session;
            let (schema_ref, cursor_ref) = (&schema, cursor.as_deref());
            let page_size = self.config.page_size;
            let page = with_retry(
                &self.config.retry,
                self.config.request_timeout,
                "fetch_row_page",
                move || session.fetch_row_page(schema_ref, cursor_ref, page_size),
            )
            .await?;

            let counts = self
                .fetch_page_attachments(&schema, &page.rows, csv_config, &layout, &mut result)
                .await?;
            add_counts(&mut result, counts);

            for row in &page.rows {
                writer.write_record(schema::map_row(row, &columns, csv_config))?;
                result.rows_processed += 1;
            }
            writer.flush()?;
            pages += 1;
            debug!(page = pages, rows = page.rows.len(), total = result.rows_processed, "page written");
            self.report(pages, &result);

            match page.next_cursor() {
                None => break,
                Some(next) => {
                    if !seen_cursors.insert(next.to_string()) {
                        return Err(SyncError::Protocol(format!(
                            "server returned cursor '{next}' twice"
                        )));
                    }
                    cursor = Some(next.to_string());
                }
            }
        }

        self.set_state(SyncState::Flushing)?;
        writer.flush()?;
        drop(writer);
        self.set_state(SyncState::Done)?;
        Ok(TaskOutcome::Completed(result))
    }

    /// Resolves and fetches the attachments of one page. Completes only once
    /// every transfer of the page has settled.
    async fn fetch_page_attachments(
        &self,
        schema: &TableSchema,
        rows: &[RowResource],
        csv_config: &CsvConfig,
        layout: &TableLayout,
        result: &mut SyncResult,
    ) -> Result<TransferCounts> {
        if !csv_config.include_attachments {
            return Ok(TransferCounts::default());
        }

        let mut refs = Vec::new();
        for row in rows {
            match self.attachments.resolve(schema, row, csv_config, layout).await {
                Ok(row_refs) => refs.extend(row_refs),
                Err(e) if e.aborts_run() => return Err(e),
                Err(e) => {
                    // The row's file count is unknown; only the row error is recorded.
                    warn!(row_id = %row.row_id, error = %e, "attachment manifest unavailable");
                    result
                        .errors
                        .push(RowError::new(row.row_id.clone(), format!("attachment manifest: {e}")));
                }
            }
        }
        self.attachments.fetch_all(&mut refs).await
    }

    /// Uploads the rows of a local CSV, then the attachment files they name.
    ///
    /// Nothing is sent unless `data_version` equals the server's current
    /// data version and every CSV column belongs to the table.
    #[instrument(skip(self, input_root, data_version), fields(app_id = %self.session.app_id()))]
    pub async fn upload(
        &self,
        table_id: &str,
        input_root: &Path,
        data_version: Option<&str>,
    ) -> Result<TaskOutcome> {
        self.begin()?;
        let outcome = self.run_upload(table_id, input_root, data_version).await;
        self.finish(outcome)
    }

    async fn run_upload(
        &self,
        table_id: &str,
        input_root: &Path,
        data_version: Option<&str>,
    ) -> Result<TaskOutcome> {
        let gate = VersionGate::new(data_version);
        if gate.supplied().is_none() {
            return Err(SyncError::MissingVersion);
        }

        let schema = self.fetch_schema(table_id).await?;
        let version = gate.check(&schema.data_version)?.to_string();

        let layout = TableLayout::for_input(input_root, self.session.app_id(), table_id);
        let mut result = SyncResult::default();
        let path = layout.csv_path();
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;
        let rows = read_rows(&schema, &content, &layout, &mut result)?;
        info!(
            path = %layout.csv_path().display(),
            rows = rows.len(),
            rejected = result.errors.len(),
            "csv read"
        );

        self.set_state(SyncState::Paging)?;
        let mut batches = 0u64;
        for batch in batch_rows(rows, self.config.upload_batch_rows, self.config.upload_batch_bytes) {
            if self.cancel.is_cancelled() {
                return self.cancelled(result);
            }

            let outcomes = self.post_batch(&schema, &batch, &version).await?;
            let accepted = apply_outcomes(&batch, outcomes, &mut result);

            let mut refs: Vec<AttachmentRef> = batch
                .into_iter()
                .filter(|pending| accepted.contains(&pending.row.row_id))
                .flat_map(|pending| pending.attachments)
                .collect();
            if !refs.is_empty() {
                let counts = self.attachments.upload_all(&schema, &mut refs).await?;
                add_counts(&mut result, counts);
            }

            batches += 1;
            self.report(batches, &result);
        }

        self.set_state(SyncState::Flushing)?;
        self.set_state(SyncState::Done)?;
        Ok(TaskOutcome::Completed(result))
    }

    async fn post_batch(
        &self,
        schema: &TableSchema,
        batch: &[PendingRow],
        version: &str,
    ) -> Result<Vec<RowOutcome>> {
        let rows: Vec<RowResource> = batch.iter().map(|pending| pending.row.clone()).collect();
        debug!(rows = rows.len(), "posting batch");

        // Row writes are not replayed.
        let session = &self.session;
        let list = with_retry(
            &RetryConfig::no_retry(),
            self.config.request_timeout,
            "post_rows",
            move || session.post_rows(schema, rows.clone(), version),
        )
        .await?;
        Ok(list.rows)
    }

    /// Deletes every row of the table at the supplied data version.
    #[instrument(skip(self, data_version), fields(app_id = %self.session.app_id()))]
    pub async fn reset(&self, table_id: &str, data_version: Option<&str>) -> Result<TaskOutcome> {
        self.begin()?;
        let outcome = self.run_reset(table_id, data_version).await;
        self.finish(outcome)
    }

    async fn run_reset(&self, table_id: &str, data_version: Option<&str>) -> Result<TaskOutcome> {
        let gate = VersionGate::new(data_version);
        if gate.supplied().is_none() {
            return Err(SyncError::MissingVersion);
        }

        let schema = self.fetch_schema(table_id).await?;
        let version = gate.check(&schema.data_version)?;

        if self.cancel.is_cancelled() {
            return self.cancelled(SyncResult::default());
        }

        let session = &self.session;
        with_retry(
            &RetryConfig::no_retry(),
            self.config.request_timeout,
            "reset_table",
            move || session.reset_table(table_id, version),
        )
        .await?;
        info!(table_id, data_version = version, "table reset");

        self.set_state(SyncState::Done)?;
        Ok(TaskOutcome::Completed(SyncResult::default()))
    }
}

fn add_counts(result: &mut SyncResult, counts: TransferCounts) {
    result.attachments_fetched += counts.fetched;
    result.attachments_skipped += counts.skipped;
    result.attachments_failed += counts.failed;
    result.errors.extend(counts.errors);
}

/// Rebuilds every row of the local CSV.
///
/// A header column outside the table is fatal; a record that cannot be
/// rebuilt, or that names an attachment outside its row folder, is recorded
/// and skipped.
fn read_rows(
    schema: &TableSchema,
    content: &[u8],
    layout: &TableLayout,
    result: &mut SyncResult,
) -> Result<Vec<PendingRow>> {
    // Accept CSVs written with or without the metadata columns.
    let columns = schema::flatten(schema, &CsvConfig::new(true, false, true));
    let mut reader = csv::Reader::from_reader(content);
    let header = reader.headers()?.clone();
    let mapping = schema::check_header(&header, &columns)?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let line = format!("line {}", index + 2);
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                result.errors.push(RowError::new(line, e.to_string()));
                continue;
            }
        };
        let rebuilt = schema::unmap_row(&record, &mapping, &columns).and_then(|row| {
            let attachments = local_attachments(&row, &record, &mapping, &columns, layout)?;
            Ok((row, attachments))
        });
        match rebuilt {
            Ok((row, attachments)) => {
                let size = serde_json::to_vec(&row).map(|body| body.len()).unwrap_or(0);
                rows.push(PendingRow {
                    row,
                    attachments,
                    size,
                });
            }
            Err(message) => {
                let row_id = id_cell(&record, &mapping, &columns).unwrap_or(line);
                result.errors.push(RowError::new(row_id, message));
            }
        }
    }
    Ok(rows)
}

fn id_cell(record: &StringRecord, mapping: &[usize], columns: &[FlatColumn]) -> Option<String> {
    record
        .iter()
        .zip(mapping)
        .find(|&(_, &index)| columns[index].name == schema::ROW_ID_COLUMN)
        .map(|(cell, _)| cell.to_string())
        .filter(|cell| !cell.is_empty())
}

/// Attachment files named by a record that exist locally.
///
/// Fails when a cell points outside the row's attachment folder.
fn local_attachments(
    row: &RowResource,
    record: &StringRecord,
    mapping: &[usize],
    columns: &[FlatColumn],
    layout: &TableLayout,
) -> std::result::Result<Vec<AttachmentRef>, String> {
    let mut attachments = Vec::new();
    for (cell, &index) in record.iter().zip(mapping) {
        if cell.is_empty() || !columns[index].is_attachment() {
            continue;
        }
        let path = layout
            .resolve_cell(&row.row_id, cell)
            .map_err(|e| format!("column '{}': {e}", columns[index].name))?;
        if path.is_file() {
            let file_name = layout::file_name_of(cell);
            attachments.push(AttachmentRef::for_upload(row.row_id.clone(), file_name, path));
        }
    }
    Ok(attachments)
}

/// Splits rows into batches bounded by row count and serialized size. A row
/// larger than `max_bytes` travels alone.
fn batch_rows(rows: Vec<PendingRow>, max_rows: usize, max_bytes: usize) -> Vec<Vec<PendingRow>> {
    let mut batches = Vec::new();
    let mut current: Vec<PendingRow> = Vec::new();
    let mut current_bytes = 0;

    for row in rows {
        let full = current.len() >= max_rows || current_bytes + row.size > max_bytes;
        if full && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += row.size;
        current.push(row);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Records per-row outcomes and returns the ids the server accepted.
fn apply_outcomes(
    batch: &[PendingRow],
    outcomes: Vec<RowOutcome>,
    result: &mut SyncResult,
) -> HashSet<String> {
    let mut by_id: HashMap<String, RowOutcome> = outcomes
        .into_iter()
        .map(|outcome| (outcome.row_id.clone(), outcome))
        .collect();
    let mut accepted = HashSet::new();

    for pending in batch {
        let row_id = &pending.row.row_id;
        match by_id.remove(row_id) {
            Some(RowOutcome {
                outcome: Outcome::Success,
                ..
            }) => {
                result.rows_processed += 1;
                accepted.insert(row_id.clone());
            }
            Some(RowOutcome {
                outcome, message, ..
            }) => {
                let reason = match outcome {
                    Outcome::Denied => "denied",
                    Outcome::InConflict => "in conflict",
                    Outcome::Failed => "failed",
                    Outcome::Unknown | Outcome::Success => "unknown outcome",
                };
                let message = match message {
                    Some(detail) => format!("{reason}: {detail}"),
                    None => reason.to_string(),
                };
                result.errors.push(RowError::new(row_id.clone(), message));
            }
            None => result
                .errors
                .push(RowError::new(row_id.clone(), "no outcome reported")),
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn pending(id: &str, size: usize) -> PendingRow {
        PendingRow {
            row: RowResource::new(id, Map::new()),
            attachments: Vec::new(),
            size,
        }
    }

    fn ids(batch: &[PendingRow]) -> Vec<&str> {
        batch.iter().map(|p| p.row.row_id.as_str()).collect()
    }

    #[test]
    fn batches_respect_row_limit() {
        let rows = (0..5).map(|i| pending(&i.to_string(), 10)).collect();
        let batches = batch_rows(rows, 2, 1_000);
        assert_eq!(batches.len(), 3);
        assert_eq!(ids(&batches[2]), vec!["4"]);
    }

    #[test]
    fn batches_respect_byte_limit() {
        let rows = vec![pending("a", 40), pending("b", 40), pending("c", 500), pending("d", 10)];
        let batches = batch_rows(rows, 100, 100);
        assert_eq!(batches.len(), 3);
        assert_eq!(ids(&batches[0]), vec!["a", "b"]);
        assert_eq!(ids(&batches[1]), vec!["c"]);
        assert_eq!(ids(&batches[2]), vec!["d"]);
    }

    #[test]
    fn outcomes_become_row_errors() {
        let batch = vec![pending("a", 1), pending("b", 1), pending("c", 1)];
        let outcomes = vec![
            RowOutcome {
                row_id: "a".into(),
                outcome: Outcome::Success,
                message: None,
            },
            RowOutcome {
                row_id: "b".into(),
                outcome: Outcome::InConflict,
                message: Some("stale etag".into()),
            },
        ];
        let mut result = SyncResult::default();
        let accepted = apply_outcomes(&batch, outcomes, &mut result);

        assert_eq!(result.rows_processed, 1);
        assert!(accepted.contains("a"));
        assert_eq!(
            result.errors,
            vec![
                RowError::new("b", "in conflict: stale etag"),
                RowError::new("c", "no outcome reported"),
            ]
        );
    }
}
