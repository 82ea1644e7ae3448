//! Validation of caller-supplied parameters.
//!
//! Every check runs before any network call or file write so a bad argument
//! never leaves partial output behind.

use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};
use url::Url;

/// Directory used for downloads when the caller gives none.
pub const DEFAULT_DOWNLOAD_DIR: &str = "Download";
/// Directory used for uploads when the caller gives none.
pub const DEFAULT_UPLOAD_DIR: &str = "Upload";

/// Returns `./Download`.
pub fn default_download_dir() -> PathBuf {
    Path::new(".").join(DEFAULT_DOWNLOAD_DIR)
}

/// Returns `./Upload`.
pub fn default_upload_dir() -> PathBuf {
    Path::new(".").join(DEFAULT_UPLOAD_DIR)
}

/// Validates server URL, app id and credential pairing.
///
/// Username and password must be both empty (anonymous access) or both set.
pub fn check_login_fields(url: &str, app_id: &str, username: &str, password: &str) -> Result<Url> {
    let parsed = parse_server_url(url)?;
    require_non_empty(app_id, "app id")?;
    if username.is_empty() != password.is_empty() {
        return Err(invalid(
            "username and password must both be provided, or both left empty for anonymous access",
        ));
    }
    Ok(parsed)
}

/// Validates download parameters.
pub fn check_download_fields(table_id: &str, path: Option<&Path>) -> Result<()> {
    require_non_empty(table_id, "table id")?;
    check_path(path)
}

/// Validates upload parameters.
pub fn check_upload_fields(table_id: &str, data_version: Option<&str>, path: Option<&Path>) -> Result<()> {
    require_non_empty(table_id, "table id")?;
    require_version(data_version)?;
    check_path(path)
}

/// Validates reset parameters.
pub fn check_reset_fields(table_id: &str, data_version: Option<&str>) -> Result<()> {
    require_non_empty(table_id, "table id")?;
    require_version(data_version)
}

fn parse_server_url(url: &str) -> Result<Url> {
    let trimmed = url.trim();
    require_non_empty(trimmed, "server url")?;
    let parsed = Url::parse(trimmed).map_err(|e| invalid(format!("bad server url '{trimmed}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!(
            "server url must use http or https, got '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(invalid(format!("server url '{trimmed}' has no host")));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid(format!(
            "server url '{trimmed}' must not carry a query or fragment"
        )));
    }
    Ok(parsed)
}

fn require_version(data_version: Option<&str>) -> Result<()> {
    match data_version.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(SyncError::MissingVersion),
    }
}

fn require_non_empty(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(invalid(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

fn check_path(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) if p.as_os_str().is_empty() => Err(invalid("path must not be empty")),
        _ => Ok(()),
    }
}

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::InvalidInput(message.into())
}
