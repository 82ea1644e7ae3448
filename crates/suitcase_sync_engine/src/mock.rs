//! In-memory server session for tests.

use crate::error::{Result, SyncError};
use crate::session::ServerSession;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use suitcase_protocol::{
    AttachmentManifest, ManifestEntry, Outcome, RowOutcome, RowOutcomeList, RowPage, RowResource,
    TableSchema,
};

/// Operations a `MockSession` can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `fetch_schema`.
    FetchSchema,
    /// `fetch_row_page`.
    FetchPage,
    /// `fetch_attachment_manifest`.
    FetchManifest,
    /// `download_attachment`.
    Download,
    /// `upload_attachment`.
    Upload,
    /// `post_rows`.
    PostRows,
    /// `reset_table`.
    Reset,
}

/// One recorded `post_rows` call.
#[derive(Debug, Clone)]
pub struct PostedBatch {
    /// Rows in the request.
    pub rows: Vec<RowResource>,
    /// Data version the request carried.
    pub data_version: String,
}

/// One recorded `upload_attachment` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Row identifier.
    pub row_id: String,
    /// File name.
    pub file_name: String,
    /// File content.
    pub content: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    schema: Option<TableSchema>,
    pages: Vec<Vec<RowResource>>,
    cursor_overrides: HashMap<usize, String>,
    manifests: HashMap<String, AttachmentManifest>,
    files: HashMap<String, Vec<u8>>,
    failing_urls: HashSet<String>,
    failures: HashMap<(MockOp, usize), SyncError>,
    outcomes: HashMap<String, Outcome>,
    calls: HashMap<MockOp, usize>,
    page_requests: Vec<Option<String>>,
    bytes_downloaded: u64,
    posted: Vec<PostedBatch>,
    uploads: Vec<UploadedFile>,
    resets: Vec<String>,
}

impl MockState {
    /// Counts the call and returns the scripted failure for it, if any.
    fn begin(&mut self, op: MockOp) -> Result<()> {
        let count = self.calls.entry(op).or_insert(0);
        let nth = *count;
        *count += 1;
        match self.failures.remove(&(op, nth)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn schema(&self) -> Result<&TableSchema> {
        self.schema
            .as_ref()
            .ok_or_else(|| SyncError::NotFound("HTTP 404: no table".into()))
    }

    fn cursor_after(&self, index: usize) -> Option<String> {
        if let Some(cursor) = self.cursor_overrides.get(&index) {
            return Some(cursor.clone());
        }
        (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1))
    }
}

/// A scripted `ServerSession` that keeps everything in memory.
///
/// Pages are served in order with cursors `page-1`, `page-2`, ...; the fetch
/// limit is ignored. Every call is counted and may be scripted to fail.
pub struct MockSession {
    app_id: String,
    state: Mutex<MockState>,
}

impl MockSession {
    /// Creates a mock serving `schema`.
    pub fn new(app_id: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            app_id: app_id.into(),
            state: Mutex::new(MockState {
                schema: Some(schema),
                ..MockState::default()
            }),
        }
    }

    /// Creates a mock for which every table is missing.
    pub fn without_table(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Sets the row pages.
    pub fn set_pages(&self, pages: Vec<Vec<RowResource>>) {
        self.state.lock().pages = pages;
    }

    /// Makes page `index` return `cursor` as its continuation.
    pub fn set_cursor_after(&self, index: usize, cursor: impl Into<String>) {
        self.state.lock().cursor_overrides.insert(index, cursor.into());
    }

    /// Sets the server's current data version.
    pub fn set_data_version(&self, version: impl Into<String>) {
        if let Some(schema) = self.state.lock().schema.as_mut() {
            schema.data_version = version.into();
        }
    }

    /// Attaches a file to a row. The download URL is `mock://{row_id}/{file_name}`.
    pub fn add_attachment(&self, row_id: &str, file_name: &str, content: Vec<u8>) -> String {
        let url = format!("mock://{row_id}/{file_name}");
        let mut state = self.state.lock();
        state
            .manifests
            .entry(row_id.to_string())
            .or_default()
            .files
            .push(ManifestEntry {
                filename: file_name.to_string(),
                content_length: Some(content.len() as u64),
                content_type: None,
                download_url: url.clone(),
            });
        state.files.insert(url.clone(), content);
        url
    }

    /// Makes every download of `url` fail with 404.
    pub fn fail_url(&self, url: impl Into<String>) {
        self.state.lock().failing_urls.insert(url.into());
    }

    /// Makes the `nth` (0-based) call of `op` fail with `error`.
    pub fn fail_call(&self, op: MockOp, nth: usize, error: SyncError) {
        self.state.lock().failures.insert((op, nth), error);
    }

    /// Makes `post_rows` report `outcome` for `row_id`.
    pub fn set_outcome(&self, row_id: impl Into<String>, outcome: Outcome) {
        self.state.lock().outcomes.insert(row_id.into(), outcome);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: MockOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Cursors of every page request, in order.
    pub fn page_requests(&self) -> Vec<Option<String>> {
        self.state.lock().page_requests.clone()
    }

    /// Total attachment bytes served.
    pub fn bytes_downloaded(&self) -> u64 {
        self.state.lock().bytes_downloaded
    }

    /// Recorded `post_rows` calls.
    pub fn posted(&self) -> Vec<PostedBatch> {
        self.state.lock().posted.clone()
    }

    /// Recorded attachment uploads.
    pub fn uploads(&self) -> Vec<UploadedFile> {
        self.state.lock().uploads.clone()
    }

    /// Data versions of recorded resets.
    pub fn resets(&self) -> Vec<String> {
        self.state.lock().resets.clone()
    }
}

#[async_trait]
impl ServerSession for MockSession {
    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn fetch_schema(&self, table_id: &str) -> Result<TableSchema> {
        let mut state = self.state.lock();
        state.begin(MockOp::FetchSchema)?;
        let schema = state.schema()?;
        if schema.table_id != table_id {
            return Err(SyncError::NotFound(format!("HTTP 404: table {table_id}")));
        }
        Ok(schema.clone())
    }

    async fn fetch_row_page(
        &self,
        _schema: &TableSchema,
        cursor: Option<&str>,
        _fetch_limit: u32,
    ) -> Result<RowPage> {
        let mut state = self.state.lock();
        state.page_requests.push(cursor.map(str::to_string));
        state.begin(MockOp::FetchPage)?;

        let index = match cursor {
            None => 0,
            Some(c) => c
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| SyncError::from_status(400, format!("bad cursor {c}")))?,
        };
        let rows = state.pages.get(index).cloned().unwrap_or_default();
        Ok(RowPage::new(rows, state.cursor_after(index)))
    }

    async fn fetch_attachment_manifest(
        &self,
        _schema: &TableSchema,
        row_id: &str,
    ) -> Result<AttachmentManifest> {
        let mut state = self.state.lock();
        state.begin(MockOp::FetchManifest)?;
        Ok(state.manifests.get(row_id).cloned().unwrap_or_default())
    }

    async fn download_attachment(&self, download_url: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.begin(MockOp::Download)?;
        if state.failing_urls.contains(download_url) {
            return Err(SyncError::from_status(404, download_url));
        }
        let content = state
            .files
            .get(download_url)
            .cloned()
            .ok_or_else(|| SyncError::from_status(404, download_url))?;
        state.bytes_downloaded += content.len() as u64;
        Ok(content)
    }

    async fn upload_attachment(
        &self,
        _schema: &TableSchema,
        row_id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.begin(MockOp::Upload)?;
        state.uploads.push(UploadedFile {
            row_id: row_id.to_string(),
            file_name: file_name.to_string(),
            content,
        });
        Ok(())
    }

    async fn post_rows(
        &self,
        _schema: &TableSchema,
        rows: Vec<RowResource>,
        data_version: &str,
    ) -> Result<RowOutcomeList> {
        let mut state = self.state.lock();
        state.begin(MockOp::PostRows)?;
        if state.schema()?.data_version != data_version {
            return Err(SyncError::from_status(409, "data version changed"));
        }

        let outcomes = rows
            .iter()
            .map(|row| RowOutcome {
                row_id: row.row_id.clone(),
                outcome: state
                    .outcomes
                    .get(&row.row_id)
                    .copied()
                    .unwrap_or(Outcome::Success),
                message: None,
            })
            .collect();
        state.posted.push(PostedBatch {
            rows,
            data_version: data_version.to_string(),
        });
        Ok(RowOutcomeList { rows: outcomes })
    }

    async fn reset_table(&self, table_id: &str, data_version: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.begin(MockOp::Reset)?;
        let schema = state.schema()?;
        if schema.table_id != table_id {
            return Err(SyncError::NotFound(format!("HTTP 404: table {table_id}")));
        }
        if schema.data_version != data_version {
            return Err(SyncError::from_status(409, "data version changed"));
        }
        state.pages.clear();
        state.resets.push(data_version.to_string());
        Ok(())
    }
}
