//! Server session abstraction.

use crate::error::Result;
use async_trait::async_trait;
use suitcase_protocol::{AttachmentManifest, RowOutcomeList, RowPage, RowResource, TableSchema};

/// A session against one app on an Aggregate server.
///
/// This trait abstracts the network layer so the engine can run against the
/// HTTP implementation or an in-memory mock.
#[async_trait]
pub trait ServerSession: Send + Sync {
    /// App the session is bound to.
    fn app_id(&self) -> &str;

    /// Fetches the table resource and its column definition.
    async fn fetch_schema(&self, table_id: &str) -> Result<TableSchema>;

    /// Fetches one page of rows. `cursor` is `None` for the first page.
    async fn fetch_row_page(
        &self,
        schema: &TableSchema,
        cursor: Option<&str>,
        fetch_limit: u32,
    ) -> Result<RowPage>;

    /// Fetches the attachment manifest of a row.
    async fn fetch_attachment_manifest(
        &self,
        schema: &TableSchema,
        row_id: &str,
    ) -> Result<AttachmentManifest>;

    /// Downloads one attachment from its manifest URL.
    async fn download_attachment(&self, download_url: &str) -> Result<Vec<u8>>;

    /// Uploads one attachment file for a row.
    async fn upload_attachment(
        &self,
        schema: &TableSchema,
        row_id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<()>;

    /// Inserts or updates rows, returning one outcome per row.
    async fn post_rows(
        &self,
        schema: &TableSchema,
        rows: Vec<RowResource>,
        data_version: &str,
    ) -> Result<RowOutcomeList>;

    /// Deletes all rows of the table at the given data version.
    async fn reset_table(&self, table_id: &str, data_version: &str) -> Result<()>;
}
