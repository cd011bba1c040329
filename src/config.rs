//! Client configuration.

use std::time::Duration;

use crate::error::{DriveError, Result};

/// OAuth client identifier registered for this application.
pub const DEFAULT_CLIENT_ID: &str =
    "332621158758-fp7vctsgrc926gs8bvtgs5t6ktepq7kf.apps.googleusercontent.com";

/// Google OAuth2 authorization endpoint.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Google OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Google OAuth2 revocation endpoint.
pub const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

/// Base URL for Google Drive API v3.
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Upload URL for Google Drive API.
pub const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Full read/write access to the user's Drive.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Loopback redirect used by installed applications.
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8080/callback";

/// Settings shared by the identity provider, the Drive service and the facade.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub application_name: String,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub api_base: String,
    pub upload_base: String,
    /// Deadline applied to every storage operation.
    pub operation_timeout: Duration,
    /// Upper bound on storage operations running at once.
    pub max_concurrent_operations: usize,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            application_name: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))
                .to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: UPLOAD_API_BASE.to_string(),
            operation_timeout: Duration::from_secs(60),
            max_concurrent_operations: 4,
        }
    }
}

impl DriveConfig {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_client_secret(mut self, client_secret: Option<String>) -> Self {
        self.client_secret = client_secret;
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    /// Point the OAuth endpoints somewhere else (tests, proxies).
    pub fn with_oauth_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.auth_url = format!("{}/auth", base);
        self.token_url = format!("{}/token", base);
        self.revoke_url = format!("{}/revoke", base);
        self
    }

    /// Point both Drive API bases somewhere else (tests, proxies).
    pub fn with_api_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.api_base = base.to_string();
        self.upload_base = format!("{}/upload", base);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_operations(mut self, max: usize) -> Self {
        self.max_concurrent_operations = max;
        self
    }

    /// Scopes requested at sign-in: identity, email and full Drive access.
    pub fn scopes(&self) -> Vec<String> {
        vec![
            "openid".to_string(),
            "email".to_string(),
            DRIVE_SCOPE.to_string(),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(DriveError::InvalidConfig("client_id is empty".into()));
        }
        if self.max_concurrent_operations == 0 {
            return Err(DriveError::InvalidConfig(
                "max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(DriveError::InvalidConfig(
                "operation_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DriveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert!(config.scopes().contains(&DRIVE_SCOPE.to_string()));
    }

    #[test]
    fn test_rejects_empty_client_id() {
        let config = DriveConfig::default().with_client_id("  ");
        assert!(matches!(config.validate(), Err(DriveError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_pool() {
        let config = DriveConfig::default().with_max_concurrent_operations(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_overrides() {
        let config = DriveConfig::default()
            .with_api_base("http://127.0.0.1:9000/")
            .with_oauth_base("http://127.0.0.1:9001");
        assert_eq!(config.api_base, "http://127.0.0.1:9000");
        assert_eq!(config.upload_base, "http://127.0.0.1:9000/upload");
        assert_eq!(config.token_url, "http://127.0.0.1:9001/token");
        assert_eq!(config.revoke_url, "http://127.0.0.1:9001/revoke");
    }
}
