//! Generic JSON-over-HTTP provider client
//!
//! Speaks a queue-style API shared by most hosted generation backends:
//! - `POST {base_url}/{model}` with the JSON payload → `{"request_id": "..."}`
//! - `GET {base_url}/{model}/requests/{request_id}` → [`PollResponse`]

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{PollResponse, ProviderClient, ProviderError, ProviderKind};

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
}

/// HTTP client for one provider
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    kind: ProviderKind,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpProviderClient {
    /// Creates a client with a default request timeout
    pub fn new(
        kind: ProviderKind,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::new(None, format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(kind, base_url, api_key, client))
    }

    /// Creates a client around a configured reqwest client
    pub fn with_client(
        kind: ProviderKind,
        base_url: impl Into<String>,
        api_key: Option<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn submit_url(&self, model: &str) -> String {
        format!("{}/{}", self.base_url, model)
    }

    fn poll_url(&self, model: &str, request_id: &str) -> String {
        format!("{}/{}/requests/{}", self.base_url, model, request_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Maps a non-success response onto a provider error carrying its status
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        if message.trim().is_empty() {
            message = status.canonical_reason().unwrap_or("Unknown error").to_string();
        }
        Err(ProviderError::new(Some(status.as_u16()), message))
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::new(err.status().map(|s| s.as_u16()), err.to_string())
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn submit(
        &self,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let request = self.authorize(self.client.post(self.submit_url(model)).json(payload));
        let response = request.send().await.map_err(transport_error)?;
        let response = Self::check(response).await?;

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new(None, format!("malformed submit response: {e}")))?;

        tracing::debug!("Submitted {} to {} as {}", model, self.kind, body.request_id);
        Ok(body.request_id)
    }

    async fn poll(&self, model: &str, request_id: &str) -> Result<PollResponse, ProviderError> {
        let request = self.authorize(self.client.get(self.poll_url(model, request_id)));
        let response = request.send().await.map_err(transport_error)?;
        let response = Self::check(response).await?;

        response
            .json()
            .await
            .map_err(|e| ProviderError::new(None, format!("malformed poll response: {e}")))
    }
}
