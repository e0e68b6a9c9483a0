use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{ModelRole, ModelSpec};

/// Errors raised by model backends and the model cache.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The runtime could not be reached or refused to serve the model.
    #[error("Model backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Every cache slot stayed busy for the whole acquire timeout.
    #[error("No model slot for {role} became free within {waited:?}")]
    CapacityTimeout {
        /// Role that was being acquired.
        role: ModelRole,
        /// How long the caller waited.
        waited: Duration,
    },
    /// No model is registered for the role.
    #[error("No model registered for role {0}")]
    Unregistered(ModelRole),
    /// The loaded model does not offer the requested capability.
    #[error("Model {model_id} does not support {capability}")]
    Unsupported {
        /// Model identifier.
        model_id: String,
        /// Capability that was requested.
        capability: &'static str,
    },
    /// The backend answered with something that could not be interpreted.
    #[error("Malformed model response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Whether the failure means "no model right now" rather than a bad request.
    ///
    /// Callers use this to choose their degraded fallback.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::CapacityTimeout { .. }
        )
    }
}

/// A model resident in the backend, shared by every holder of a cache handle.
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Backend-specific identifier of the loaded model.
    fn model_id(&self) -> &str;

    /// Produce one vector per input text.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Produce a completion for `prompt`. An empty reply means the model has no opinion.
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    /// Release backend resources. Called by the cache after eviction.
    async fn unload(&self) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Runtime able to load models on demand.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Load the model described by `spec` for `role`.
    async fn load(&self, role: ModelRole, spec: &ModelSpec)
    -> Result<Arc<dyn LoadedModel>, ModelError>;
}
