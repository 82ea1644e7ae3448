//! Server endpoint and credentials.

use crate::error::{Result, SyncError};
use crate::validate;
use std::fmt;
use url::Url;

/// Credential material presented to the server.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// No authentication.
    Anonymous,
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
}

impl Credentials {
    /// Builds credentials from a username/password pair; two empty strings
    /// mean anonymous access.
    pub fn from_parts(username: &str, password: &str) -> Self {
        if username.is_empty() && password.is_empty() {
            Credentials::Anonymous
        } else {
            Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }
        }
    }

    /// Returns true for anonymous access.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Connection to one app on an Aggregate server.
///
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ServerConnection {
    base_url: Url,
    app_id: String,
    credentials: Credentials,
}

impl ServerConnection {
    /// Validates and creates a connection.
    pub fn new(base_url: &str, app_id: &str, username: &str, password: &str) -> Result<Self> {
        let base_url = validate::check_login_fields(base_url, app_id, username, password)?;
        Ok(Self {
            base_url,
            app_id: app_id.trim().to_string(),
            credentials: Credentials::from_parts(username, password),
        })
    }

    /// Server base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// App identifier.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Builds `{base}/{appId}/tables/{tableId}/{segments...}` with each
    /// segment percent-encoded.
    pub fn table_url(&self, table_id: &str, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidInput(format!("cannot extend url {}", self.base_url)))?
            .pop_if_empty()
            .push(&self.app_id)
            .push("tables")
            .push(table_id)
            .extend(segments);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_when_both_empty() {
        assert!(Credentials::from_parts("", "").is_anonymous());
        assert!(!Credentials::from_parts("u", "p").is_anonymous());
    }

    #[test]
    fn debug_redacts_password() {
        let creds = Credentials::from_parts("alice", "hunter2");
        let shown = format!("{creds:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn rejects_invalid_connection() {
        assert!(ServerConnection::new("not a url", "default", "", "").is_err());
        assert!(ServerConnection::new("https://agg.example.com", "", "", "").is_err());
        assert!(ServerConnection::new("https://agg.example.com", "default", "u", "").is_err());
    }

    #[test]
    fn builds_table_urls() {
        let conn = ServerConnection::new("https://agg.example.com/odktables/", "default", "", "").unwrap();
        let url = conn.table_url("census", &[]).unwrap();
        assert_eq!(url.as_str(), "https://agg.example.com/odktables/default/tables/census");

        let url = conn
            .table_url("census", &["ref", "s1", "attachments", "uuid:1", "manifest"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://agg.example.com/odktables/default/tables/census/ref/s1/attachments/uuid:1/manifest"
        );
    }

    #[test]
    fn table_url_encodes_segments() {
        let conn = ServerConnection::new("https://agg.example.com", "my app", "", "").unwrap();
        let url = conn.table_url("a/b", &[]).unwrap();
        assert_eq!(url.as_str(), "https://agg.example.com/my%20app/tables/a%2Fb");
    }
}
