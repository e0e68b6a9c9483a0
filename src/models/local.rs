use async_trait::async_trait;
use std::sync::Arc;

use super::{LoadedModel, ModelBackend, ModelError, ModelRole, ModelSpec};

/// Deterministic in-process backend.
///
/// Embeddings hash tokens into a fixed number of buckets, so identical text always yields the
/// same vector. Completions are empty, which every caller treats as "no opinion".
pub struct LocalBackend {
    dimension: usize,
}

impl LocalBackend {
    /// Backend producing vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl ModelBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn load(
        &self,
        role: ModelRole,
        spec: &ModelSpec,
    ) -> Result<Arc<dyn LoadedModel>, ModelError> {
        tracing::debug!(%role, model = %spec.model_id, "Loading local model");
        Ok(Arc::new(LocalModel {
            model_id: spec.model_id.clone(),
            dimension: self.dimension,
        }))
    }
}

struct LocalModel {
    model_id: String,
    dimension: usize,
}

impl LocalModel {
    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let hash = fnv1a(token.as_bytes());
            let position = (hash % dimension as u64) as usize;
            // High bit picks the sign so unrelated tokens partly cancel out.
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            embedding[position] += sign;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl LoadedModel for LocalModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if self.dimension == 0 {
            return Err(ModelError::InvalidResponse(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        Ok(texts
            .iter()
            .map(|text| Self::encode(text, self.dimension))
            .collect())
    }

    async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
        Ok(String::new())
    }
}
