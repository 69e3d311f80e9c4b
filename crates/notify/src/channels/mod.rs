//! Messaging channel implementations.

pub mod webex;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// A recipient as known by the messaging platform (e.g. a Webex person id).
///
/// This is what lab records are keyed on, not the raw owner key from the lab
/// platform, so a record always points at someone who can be notified.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait for messaging channels (Webex, etc.).
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Resolve an owner key (usually an e-mail address) to a recipient.
    async fn resolve_identity(&self, owner_key: &str) -> Result<Identity, ChannelError>;

    /// Send a markdown message to a single recipient.
    async fn send(&self, to: &Identity, markdown: &str) -> Result<(), ChannelError>;
}
