//! HTTP session against the Aggregate table API.

use crate::connection::{Credentials, ServerConnection};
use crate::error::{Result, SyncError};
use crate::session::ServerSession;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use suitcase_protocol::{
    AlterRowsRequest, AttachmentManifest, RowOutcomeList, RowPage, RowResource, TableDefinition,
    TableResource, TableSchema,
};
use tracing::{debug, error};
use url::Url;

const PROTOCOL_HEADER: &str = "x-opendatakit-version";
const PROTOCOL_VERSION: &str = "2.0";

/// `ServerSession` backed by a reqwest client.
pub struct HttpSession {
    connection: ServerConnection,
    client: reqwest::Client,
}

impl HttpSession {
    /// Creates a session for the given connection.
    ///
    /// `timeout` bounds every request, including body transfer.
    pub fn new(connection: ServerConnection, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(PROTOCOL_HEADER),
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .user_agent(concat!("suitcase/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { connection, client })
    }

    /// Returns the connection.
    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.connection.credentials() {
            Credentials::Anonymous => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }

    /// GET request for an attachment. Credentials only go to the server's
    /// own origin.
    fn download_request(&self, url: Url) -> RequestBuilder {
        let same_origin = url.origin() == self.connection.base_url().origin();
        let request = self.client.get(url);
        if same_origin {
            self.authorize(request)
        } else {
            request
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(%url, "GET");
        let response = self.authorize(self.client.get(url)).send().await?;
        decode(check_status(response).await?).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    error!(%url, status = status.as_u16(), "request failed");
    Err(SyncError::from_status(status.as_u16(), body))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| SyncError::Protocol(e.to_string()))
}

#[async_trait]
impl ServerSession for HttpSession {
    fn app_id(&self) -> &str {
        self.connection.app_id()
    }

    async fn fetch_schema(&self, table_id: &str) -> Result<TableSchema> {
        let resource: TableResource = self.get_json(self.connection.table_url(table_id, &[])?).await?;
        let url = self
            .connection
            .table_url(table_id, &["ref", &resource.schema_etag])?;
        let definition: TableDefinition = self.get_json(url).await?;
        Ok(TableSchema::from_parts(resource, definition)?)
    }

    async fn fetch_row_page(
        &self,
        schema: &TableSchema,
        cursor: Option<&str>,
        fetch_limit: u32,
    ) -> Result<RowPage> {
        let mut url = self
            .connection
            .table_url(&schema.table_id, &["ref", &schema.schema_etag, "rows"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("fetchLimit", &fetch_limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        self.get_json(url).await
    }

    async fn fetch_attachment_manifest(
        &self,
        schema: &TableSchema,
        row_id: &str,
    ) -> Result<AttachmentManifest> {
        let url = self.connection.table_url(
            &schema.table_id,
            &["ref", &schema.schema_etag, "attachments", row_id, "manifest"],
        )?;
        self.get_json(url).await
    }

    async fn download_attachment(&self, download_url: &str) -> Result<Vec<u8>> {
        let url = Url::parse(download_url)
            .map_err(|e| SyncError::transport_fatal(format!("bad download url '{download_url}': {e}")))?;
        debug!(%url, "GET attachment");
        let response = self.download_request(url).send().await?;
        let mut response = check_status(response).await?;

        let mut content = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        while let Some(chunk) = response.chunk().await? {
            content.extend_from_slice(&chunk);
        }
        Ok(content)
    }

    async fn upload_attachment(
        &self,
        schema: &TableSchema,
        row_id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let url = self.connection.table_url(
            &schema.table_id,
            &["ref", &schema.schema_etag, "attachments", row_id, "file", file_name],
        )?;
        debug!(%url, bytes = content.len(), "PUT attachment");
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content);
        let response = self.authorize(request).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn post_rows(
        &self,
        schema: &TableSchema,
        rows: Vec<RowResource>,
        data_version: &str,
    ) -> Result<RowOutcomeList> {
        let url = self
            .connection
            .table_url(&schema.table_id, &["ref", &schema.schema_etag, "rows"])?;
        let body = AlterRowsRequest {
            rows,
            data_version: data_version.to_string(),
        };
        debug!(%url, rows = body.rows.len(), "PUT rows");
        let response = self.authorize(self.client.put(url).json(&body)).send().await?;
        decode(check_status(response).await?).await
    }

    async fn reset_table(&self, table_id: &str, data_version: &str) -> Result<()> {
        let mut url = self.connection.table_url(table_id, &[])?;
        url.query_pairs_mut().append_pair("dataVersion", data_version);
        debug!(%url, "DELETE table rows");
        let response = self.authorize(self.client.delete(url)).send().await?;
        check_status(response).await?;
        Ok(())
    }
}
