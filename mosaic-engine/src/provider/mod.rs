//! External generation providers
//!
//! The orchestrator talks to providers only through [`ProviderClient`]:
//! submit a job, get a request id back, poll it until terminal.

mod http;
mod registry;

pub use http::HttpProviderClient;
pub use registry::{ModelCatalog, ModelEntry, ProviderEndpoint, ProviderRegistry, RegistryError};

use async_trait::async_trait;
use mosaic_core::domain::step::Step;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported provider backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Fal,
    Replicate,
    Runway,
    Kling,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Fal,
        ProviderKind::Replicate,
        ProviderKind::Runway,
        ProviderKind::Kling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Fal => "fal",
            ProviderKind::Replicate => "replicate",
            ProviderKind::Runway => "runway",
            ProviderKind::Kling => "kling",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownProvider(s.to_string()))
    }
}

/// Failure returned by a provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "provider error ({status}): {}", self.message),
            None => write!(f, "provider error: {}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Provider-side job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollStatus::Completed | PollStatus::Failed)
    }
}

/// Result of one poll call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: PollStatus,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub error: Option<ProviderFailure>,
}

impl PollResponse {
    pub fn queued() -> Self {
        Self {
            status: PollStatus::Queued,
            outputs: Vec::new(),
            error: None,
        }
    }

    pub fn running() -> Self {
        Self {
            status: PollStatus::Running,
            ..Self::queued()
        }
    }

    pub fn completed(outputs: Vec<String>) -> Self {
        Self {
            status: PollStatus::Completed,
            outputs,
            error: None,
        }
    }

    pub fn failed(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status: PollStatus::Failed,
            outputs: Vec::new(),
            error: Some(ProviderFailure {
                status,
                message: message.into(),
            }),
        }
    }
}

/// Failure detail reported by a terminal poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    #[serde(default)]
    pub status: Option<u16>,
    pub message: String,
}

impl From<ProviderFailure> for ProviderError {
    fn from(failure: ProviderFailure) -> Self {
        ProviderError::new(failure.status, failure.message)
    }
}

/// Client for one provider backend
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Starts a generation job and returns the provider's request id
    async fn submit(&self, model: &str, payload: &serde_json::Value)
    -> Result<String, ProviderError>;

    /// Fetches the current status of a submitted job
    async fn poll(&self, model: &str, request_id: &str) -> Result<PollResponse, ProviderError>;
}

/// Builds the submit payload for a step
///
/// Provider-specific `params` are merged last and may override the common
/// fields.
pub fn build_payload(step: &Step) -> serde_json::Value {
    let config = &step.config;
    let mut payload = serde_json::Map::new();

    payload.insert("prompt".into(), config.prompt.clone().into());
    if let Some(input) = &step.input_asset {
        payload.insert("image_url".into(), input.clone().into());
    }
    if let Some(negative) = &config.negative_prompt {
        payload.insert("negative_prompt".into(), negative.clone().into());
    }
    if let Some(quality) = &config.quality {
        payload.insert("quality".into(), quality.clone().into());
    }
    if let Some(resolution) = &config.resolution {
        payload.insert("resolution".into(), resolution.clone().into());
    }
    payload.insert("num_outputs".into(), config.num_outputs.into());

    for (key, value) in &config.params {
        payload.insert(key.clone(), value.clone());
    }

    serde_json::Value::Object(payload)
}
