//! Error types for messaging channels.

use thiserror::Error;

/// Errors that can occur when resolving recipients or sending messages.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed (connect, timeout, body read)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The messaging platform has no person for this owner key
    #[error("No messaging identity found for '{0}'")]
    NotFound(String),

    /// The messaging API answered with a non-success status
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChannelError {
    /// Whether this error only concerns the one recipient (as opposed to the
    /// channel being unreachable for everyone).
    #[must_use]
    pub const fn is_recipient_error(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
