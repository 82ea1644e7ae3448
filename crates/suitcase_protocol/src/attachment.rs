//! Attachment manifests.

use serde::{Deserialize, Serialize};

/// One file attached to a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// File name relative to the row's attachment folder.
    pub filename: String,
    /// Size in bytes, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Absolute URL the file is served from.
    pub download_url: String,
}

/// `GET .../attachments/{rowId}/manifest` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentManifest {
    /// Files attached to the row.
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
}
