//! VIRL / CML controller REST client.
//!
//! API root is `/api/v0`. Login returns a bare JSON string that is used as a
//! bearer token for every other call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info};

use super::{DiagnosticsDocument, LabPlatform, PlatformError, Session};
use crate::config::PlatformCredentials;

const API_PREFIX: &str = "/api/v0";

/// Client for one lab controller.
#[derive(Clone)]
pub struct VirlClient {
    client: Client,
    server_id: String,
    base_url: String,
    credentials: PlatformCredentials,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

impl VirlClient {
    /// Create a client for `server`.
    ///
    /// `server` is a host (`virl.example.com`, https is assumed) or a full
    /// base URL.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        server: impl Into<String>,
        credentials: PlatformCredentials,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, PlatformError> {
        let server_id = server.into();
        let base_url = if server_id.contains("://") {
            server_id.trim_end_matches('/').to_string()
        } else {
            format!("https://{server_id}")
        };

        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            server_id,
            base_url,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    /// Map non-success statuses to errors; 401/403 mean the session is bad.
    async fn check(response: Response) -> Result<Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(PlatformError::Auth(format!("{status}: {message}")));
        }
        Err(PlatformError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// PUT with no body, used by the lab state transitions.
    async fn put_action(&self, session: &Session, path: &str) -> Result<(), PlatformError> {
        let url = self.url(path);
        debug!(server = %self.server_id, url = %url, "PUT request");

        let response = self
            .client
            .put(&url)
            .bearer_auth(session.token())
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl LabPlatform for VirlClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn authenticate(&self) -> Result<Session, PlatformError> {
        let url = self.url("/authenticate");
        debug!(server = %self.server_id, "Authenticating");

        let response = self
            .client
            .post(&url)
            .json(&AuthRequest {
                username: &self.credentials.username,
                password: &self.credentials.password,
            })
            .send()
            .await?;

        let body = Self::check(response).await?.text().await?;
        let token: String = serde_json::from_str(&body)?;
        if token.is_empty() {
            return Err(PlatformError::Auth("controller returned an empty token".to_string()));
        }
        Ok(Session::new(token))
    }

    async fn fetch_diagnostics(
        &self,
        session: &Session,
    ) -> Result<DiagnosticsDocument, PlatformError> {
        let url = self.url("/diagnostics");
        debug!(server = %self.server_id, "Fetching diagnostics");

        let response = self
            .client
            .get(&url)
            .bearer_auth(session.token())
            .header("Accept", "application/json")
            .header("Cache-Control", "no-cache")
            .send()
            .await?;

        let body = Self::check(response).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn stop_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError> {
        info!(server = %self.server_id, lab = lab_id, "Stopping lab");
        self.put_action(session, &format!("/labs/{lab_id}/stop")).await
    }

    async fn wipe_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError> {
        info!(server = %self.server_id, lab = lab_id, "Wiping lab");
        self.put_action(session, &format!("/labs/{lab_id}/wipe")).await
    }

    async fn delete_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError> {
        info!(server = %self.server_id, lab = lab_id, "Deleting lab");
        let url = self.url(&format!("/labs/{lab_id}"));

        let response = self
            .client
            .delete(&url)
            .bearer_auth(session.token())
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}
