//! Mosaic HTTP Client
//!
//! A simple, type-safe HTTP client for the Mosaic orchestrator API, shared
//! by the CLI and any other tool that drives bulk pipelines remotely.
//!
//! # Example
//!
//! ```no_run
//! use mosaic_client::OrchestratorClient;
//! use mosaic_core::dto::pipeline::{CombinationMode, CreateBulkPipeline, TransformStage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let created = client.submit_bulk(&CreateBulkPipeline {
//!         name: "lookbook".to_string(),
//!         sources: vec!["https://assets.example/model.png".to_string()],
//!         transform: Some(TransformStage {
//!             model: "flux-dev".to_string(),
//!             prompts: vec!["denim jacket".to_string()],
//!             outputs_per_prompt: 1,
//!             settings: Default::default(),
//!         }),
//!         animate: None,
//!         mode: CombinationMode::Photos,
//!         tags: vec![],
//!     }).await?;
//!
//!     println!("Created pipeline: {}", created.pipeline_id);
//!     Ok(())
//! }
//! ```

pub mod error;
mod pipelines;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the Mosaic orchestrator API
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use mosaic_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = Self::check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status code of a response without a body
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        Self::check_status(response).await.map(|_| ())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        tracing::debug!("Orchestrator returned {}: {}", status, body);
        Err(ClientError::from_body(status.as_u16(), &body))
    }
}
