//! Model catalog and provider registry
//!
//! The catalog is a TOML file listing every model the engine may call:
//!
//! ```toml
//! [providers.fal]
//! base_url = "https://queue.fal.run"
//! api_key_env = "FAL_KEY"
//!
//! [[models]]
//! id = "flux-dev"
//! provider = "fal"
//! step_type = "transform_image"
//! unit_price = 0.025
//! ```
//!
//! It is validated once at startup; a bad entry stops the process instead of
//! surfacing later as a failed step.

use mosaic_core::domain::step::StepType;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{ProviderClient, ProviderKind};

/// Registry and catalog errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Duplicate model id: {0}")]
    DuplicateModel(String),

    #[error("Model id cannot be empty")]
    EmptyModelId,

    #[error("Model {model} has an invalid unit price")]
    InvalidPrice { model: String },

    #[error("No client registered for provider {0}")]
    MissingClient(ProviderKind),

    #[error("Failed to read model catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse model catalog: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Connection settings for one provider
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Calls per minute, overriding the engine-wide rate limit
    #[serde(default)]
    pub rate_limit_per_minute: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawModel {
    id: String,
    provider: String,
    step_type: StepType,
    #[serde(default)]
    unit_price: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    providers: BTreeMap<String, ProviderEndpoint>,
    #[serde(default)]
    models: Vec<RawModel>,
}

/// Validated catalog entry
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub id: String,
    pub provider: ProviderKind,
    pub step_type: StepType,
    pub unit_price: f64,
}

/// Parsed and validated model catalog
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    pub providers: BTreeMap<ProviderKind, ProviderEndpoint>,
    pub models: Vec<ModelEntry>,
}

impl ModelCatalog {
    /// Reads and validates a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses and validates catalog text
    pub fn from_toml_str(contents: &str) -> Result<Self, RegistryError> {
        let raw: RawCatalog = toml::from_str(contents)?;

        let mut providers = BTreeMap::new();
        for (name, endpoint) in raw.providers {
            providers.insert(name.parse::<ProviderKind>()?, endpoint);
        }

        let mut seen = std::collections::HashSet::new();
        let mut models = Vec::with_capacity(raw.models.len());
        for model in raw.models {
            let id = model.id.trim().to_string();
            if id.is_empty() {
                return Err(RegistryError::EmptyModelId);
            }
            if !seen.insert(id.clone()) {
                return Err(RegistryError::DuplicateModel(id));
            }
            if !model.unit_price.is_finite() || model.unit_price < 0.0 {
                return Err(RegistryError::InvalidPrice { model: id });
            }

            models.push(ModelEntry {
                provider: model.provider.parse()?,
                id,
                step_type: model.step_type,
                unit_price: model.unit_price,
            });
        }

        Ok(Self { providers, models })
    }

    /// Providers referenced by at least one model
    pub fn used_providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.models.iter().map(|m| m.provider).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

/// Model lookup plus one client per provider
pub struct ProviderRegistry {
    models: HashMap<String, ModelEntry>,
    clients: HashMap<ProviderKind, Arc<dyn ProviderClient>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Builds the registry, failing if any catalog model lacks a client
    pub fn new(
        catalog: &ModelCatalog,
        clients: HashMap<ProviderKind, Arc<dyn ProviderClient>>,
    ) -> Result<Self, RegistryError> {
        for kind in catalog.used_providers() {
            if !clients.contains_key(&kind) {
                return Err(RegistryError::MissingClient(kind));
            }
        }

        let models = catalog
            .models
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();

        Ok(Self { models, clients })
    }

    pub fn model(&self, id: &str) -> Option<&ModelEntry> {
        self.models.get(id)
    }

    pub fn client(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&kind).cloned()
    }

    /// Catalog entry and client for a model id
    pub fn resolve(
        &self,
        model_id: &str,
    ) -> Result<(&ModelEntry, Arc<dyn ProviderClient>), RegistryError> {
        let entry = self
            .model(model_id)
            .ok_or_else(|| RegistryError::UnknownModel(model_id.to_string()))?;
        let client = self
            .client(entry.provider)
            .ok_or(RegistryError::MissingClient(entry.provider))?;
        Ok((entry, client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{PollResponse, ProviderError};
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl ProviderClient for NullClient {
        async fn submit(
            &self,
            _model: &str,
            _payload: &serde_json::Value,
        ) -> Result<String, ProviderError> {
            Ok("req".to_string())
        }

        async fn poll(&self, _model: &str, _request_id: &str) -> Result<PollResponse, ProviderError> {
            Ok(PollResponse::queued())
        }
    }

    const CATALOG: &str = r#"
        [providers.fal]
        base_url = "https://queue.fal.run"
        api_key_env = "FAL_KEY"

        [[models]]
        id = "flux-dev"
        provider = "fal"
        step_type = "transform_image"
        unit_price = 0.025

        [[models]]
        id = "kling-1.6"
        provider = "kling"
        step_type = "animate_image"
        unit_price = 0.28
    "#;

    #[test]
    fn test_parse_catalog() {
        let catalog = ModelCatalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.models.len(), 2);
        assert_eq!(catalog.models[1].provider, ProviderKind::Kling);
        assert_eq!(
            catalog.providers[&ProviderKind::Fal].api_key_env.as_deref(),
            Some("FAL_KEY")
        );
        assert_eq!(
            catalog.used_providers(),
            vec![ProviderKind::Fal, ProviderKind::Kling]
        );
    }

    #[test]
    fn test_catalog_rejects_bad_entries() {
        let unknown = r#"
            [[models]]
            id = "x"
            provider = "midjourney"
            step_type = "transform_image"
        "#;
        assert!(matches!(
            ModelCatalog::from_toml_str(unknown),
            Err(RegistryError::UnknownProvider(_))
        ));

        let duplicate = r#"
            [[models]]
            id = "x"
            provider = "fal"
            step_type = "transform_image"

            [[models]]
            id = "x"
            provider = "fal"
            step_type = "animate_image"
        "#;
        assert!(matches!(
            ModelCatalog::from_toml_str(duplicate),
            Err(RegistryError::DuplicateModel(_))
        ));

        let empty = r#"
            [[models]]
            id = "  "
            provider = "fal"
            step_type = "transform_image"
        "#;
        assert!(matches!(
            ModelCatalog::from_toml_str(empty),
            Err(RegistryError::EmptyModelId)
        ));

        assert!(matches!(
            ModelCatalog::from_toml_str("models = 3"),
            Err(RegistryError::Parse(_))
        ));
    }

    #[test]
    fn test_registry_requires_clients() {
        let catalog = ModelCatalog::from_toml_str(CATALOG).unwrap();

        let mut clients: HashMap<ProviderKind, Arc<dyn ProviderClient>> = HashMap::new();
        clients.insert(ProviderKind::Fal, Arc::new(NullClient));
        assert!(matches!(
            ProviderRegistry::new(&catalog, clients.clone()),
            Err(RegistryError::MissingClient(ProviderKind::Kling))
        ));

        clients.insert(ProviderKind::Kling, Arc::new(NullClient));
        let registry = ProviderRegistry::new(&catalog, clients).unwrap();
        let (entry, _client) = registry.resolve("flux-dev").unwrap();
        assert_eq!(entry.step_type, StepType::TransformImage);
        assert!(matches!(
            registry.resolve("sdxl"),
            Err(RegistryError::UnknownModel(_))
        ));
    }
}
