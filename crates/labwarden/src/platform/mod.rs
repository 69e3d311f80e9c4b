//! Lab platform abstraction.
//!
//! The reconciliation engine only needs five calls from a lab server:
//! log in, pull diagnostics, and the stop/wipe/delete trio used to reclaim a
//! lab. [`LabPlatform`] captures exactly that; [`VirlClient`] implements it
//! against the controller REST API.

pub mod models;
mod virl;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use models::DiagnosticsDocument;
pub use virl::VirlClient;

/// Errors that can occur during lab platform operations.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Credentials were rejected or the session expired.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed (connect, TLS, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Response body did not have the expected shape.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bearer token returned by a successful login.
#[derive(Clone)]
pub struct Session {
    token: String,
}

impl Session {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session(<redacted>)")
    }
}

/// A single lab server.
#[async_trait]
pub trait LabPlatform: Send + Sync {
    /// Identifier used in records and logs (the configured host).
    fn server_id(&self) -> &str;

    /// Log in and obtain a session.
    async fn authenticate(&self) -> Result<Session, PlatformError>;

    /// Fetch the full diagnostics document.
    async fn fetch_diagnostics(&self, session: &Session)
        -> Result<DiagnosticsDocument, PlatformError>;

    /// Stop every node of a lab.
    async fn stop_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError>;

    /// Wipe node disks of a stopped lab.
    async fn wipe_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError>;

    /// Delete a wiped lab.
    async fn delete_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError>;
}
