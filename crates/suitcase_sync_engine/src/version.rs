//! Data-version gate for writes.

use crate::error::{Result, SyncError};
use tracing::warn;

/// Rejects uploads and resets whose data version is not the server's current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionGate {
    supplied: Option<String>,
}

impl VersionGate {
    /// Creates a gate for the version the caller supplied.
    pub fn new(supplied: Option<&str>) -> Self {
        Self {
            supplied: supplied
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        }
    }

    /// Supplied version, if any.
    pub fn supplied(&self) -> Option<&str> {
        self.supplied.as_deref()
    }

    /// Allows the write only if the supplied version equals `server`.
    pub fn check(&self, server: &str) -> Result<&str> {
        let supplied = self.supplied.as_deref().ok_or(SyncError::MissingVersion)?;
        if supplied != server {
            warn!(supplied, server, "stale data version");
            return Err(SyncError::VersionConflict {
                supplied: supplied.to_string(),
                server: server.to_string(),
            });
        }
        Ok(supplied)
    }
}
