//! Webex messaging channel.
//!
//! Uses the people API to turn an e-mail address into a person id and the
//! messages API to deliver markdown directly to that person.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Identity, Messenger};
use crate::error::ChannelError;

/// Public Webex API base URL.
pub const DEFAULT_API_BASE: &str = "https://webexapis.com/v1";

/// Webex bot channel authenticated with a bearer token.
#[derive(Clone)]
pub struct WebexMessenger {
    client: Client,
    token: String,
    api_base: String,
}

impl fmt::Debug for WebexMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebexMessenger")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct PeopleResponse {
    #[serde(default)]
    items: Vec<Person>,
}

#[derive(Debug, Deserialize)]
struct Person {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest<'a> {
    to_person_id: &'a str,
    markdown: &'a str,
}

impl WebexMessenger {
    /// Create a Webex channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty or the HTTP client cannot be built.
    pub fn new(
        token: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ChannelError::NotConfigured(
                "Webex access token is empty".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            token,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: Response) -> Result<Response, ChannelError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(ChannelError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl Messenger for WebexMessenger {
    fn name(&self) -> &'static str {
        "webex"
    }

    async fn resolve_identity(&self, owner_key: &str) -> Result<Identity, ChannelError> {
        let url = format!("{}/people", self.api_base);
        debug!(owner = owner_key, "Resolving Webex person");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("email", owner_key)])
            .send()
            .await?;

        let body = Self::check(response).await?.text().await?;
        let people: PeopleResponse = serde_json::from_str(&body)?;

        people
            .items
            .into_iter()
            .next()
            .map(|p| Identity::new(p.id))
            .ok_or_else(|| ChannelError::NotFound(owner_key.to_string()))
    }

    async fn send(&self, to: &Identity, markdown: &str) -> Result<(), ChannelError> {
        let url = format!("{}/messages", self.api_base);
        debug!(to = %to, "Sending Webex message");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&MessageRequest {
                to_person_id: to.as_str(),
                markdown,
            })
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}
