//! Ollama runtime reached over HTTP.
//!
//! Loading a model issues an empty request with a `keep_alive` so Ollama keeps it resident;
//! unloading sends `keep_alive: 0`. Connection failures and 404s (model not pulled) surface as
//! [`ModelError::BackendUnavailable`] so callers take their degraded path.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{LoadedModel, ModelBackend, ModelError, ModelRole, ModelSpec};

const KEEP_ALIVE: &str = "30m";

/// Backend issuing requests to a local Ollama runtime.
pub struct OllamaBackend {
    http: Client,
    base_url: String,
}

impl OllamaBackend {
    /// Create a backend for the runtime at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ModelError> {
        let http = Client::builder()
            .user_agent("sitedocs/models")
            .build()
            .map_err(|error| ModelError::BackendUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn load(
        &self,
        role: ModelRole,
        spec: &ModelSpec,
    ) -> Result<Arc<dyn LoadedModel>, ModelError> {
        let model = OllamaModel {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            model_id: spec.model_id.clone(),
            role,
        };
        let (path, payload) = match role {
            ModelRole::Embedding => (
                "api/embed",
                json!({ "model": spec.model_id, "input": [], "keep_alive": KEEP_ALIVE }),
            ),
            ModelRole::Classification | ModelRole::Generation => (
                "api/generate",
                json!({ "model": spec.model_id, "keep_alive": KEEP_ALIVE }),
            ),
        };
        model.post(path, &payload).await?;
        tracing::info!(%role, model = %spec.model_id, "Loaded Ollama model");
        Ok(Arc::new(model))
    }
}

struct OllamaModel {
    http: Client,
    base_url: String,
    model_id: String,
    role: ModelRole,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    done: bool,
}

impl OllamaModel {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<reqwest::Response, ModelError> {
        let endpoint = self.endpoint(path);
        let response = self
            .http
            .post(&endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|error| {
                ModelError::BackendUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ModelError::BackendUnavailable(format!(
                "model {} not available at {endpoint}",
                self.model_id
            ))),
            status if status.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(ModelError::BackendUnavailable(format!(
                    "Ollama returned {status}: {body}"
                )))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ModelError::InvalidResponse(format!(
                    "Ollama returned {status}: {body}"
                )))
            }
        }
    }
}

#[async_trait]
impl LoadedModel for OllamaModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if self.role != ModelRole::Embedding {
            return Err(ModelError::Unsupported {
                model_id: self.model_id.clone(),
                capability: "embeddings",
            });
        }
        let payload = json!({ "model": self.model_id, "input": texts, "keep_alive": KEEP_ALIVE });
        let body: EmbedResponse = self
            .post("api/embed", &payload)
            .await?
            .json()
            .await
            .map_err(|error| {
                ModelError::InvalidResponse(format!("failed to decode embeddings: {error}"))
            })?;
        if body.embeddings.len() != texts.len() {
            return Err(ModelError::InvalidResponse(format!(
                "expected {} embeddings, received {}",
                texts.len(),
                body.embeddings.len()
            )));
        }
        Ok(body.embeddings)
    }

    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        if self.role == ModelRole::Embedding {
            return Err(ModelError::Unsupported {
                model_id: self.model_id.clone(),
                capability: "completions",
            });
        }
        let payload = json!({
            "model": self.model_id,
            "prompt": prompt,
            "stream": false,
            "keep_alive": KEEP_ALIVE,
            "options": { "temperature": 0.1 }
        });
        let body: GenerateResponse = self
            .post("api/generate", &payload)
            .await?
            .json()
            .await
            .map_err(|error| {
                ModelError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
            })?;
        if !body.done {
            return Err(ModelError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }
        Ok(body.response.trim().to_string())
    }

    async fn unload(&self) -> Result<(), ModelError> {
        let (path, payload) = match self.role {
            ModelRole::Embedding => (
                "api/embed",
                json!({ "model": self.model_id, "input": [], "keep_alive": 0 }),
            ),
            _ => (
                "api/generate",
                json!({ "model": self.model_id, "keep_alive": 0 }),
            ),
        };
        self.post(path, &payload).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn loads_and_completes() {
        let server = MockServer::start_async().await;
        let mut load = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body_partial(r#"{"model":"llama","keep_alive":"30m"}"#);
                then.status(200).json_body(json!({ "response": "", "done": true }));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url()).expect("backend");
        let model = backend
            .load(ModelRole::Generation, &ModelSpec::new("llama"))
            .await
            .expect("load");
        load.assert_async().await;
        // The preload body is a subset of every generate request.
        load.delete_async().await;

        let complete = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body_partial(r#"{"prompt":"Classify"}"#);
                then.status(200)
                    .json_body(json!({ "response": " contract \n", "done": true }));
            })
            .await;
        let reply = model.complete("Classify").await.expect("complete");
        complete.assert_async().await;
        assert_eq!(reply, "contract");
    }

    #[tokio::test]
    async fn embeds_in_one_request() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200)
                    .json_body(json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] }));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url()).expect("backend");
        let model = backend
            .load(ModelRole::Embedding, &ModelSpec::new("nomic"))
            .await
            .expect("load");
        let vectors = model
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .expect("embed");
        assert_eq!(vectors.len(), 2);
        assert!(model.complete("x").await.is_err());
    }

    #[tokio::test]
    async fn missing_model_is_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(404).body("model not found");
            })
            .await;

        let backend = OllamaBackend::new(server.base_url()).expect("backend");
        let error = backend
            .load(ModelRole::Classification, &ModelSpec::new("missing"))
            .await
            .err()
            .expect("load must fail");
        assert!(error.is_unavailable());
    }

    #[tokio::test]
    async fn unreachable_runtime_is_unavailable() {
        let backend = OllamaBackend::new("http://127.0.0.1:9").expect("backend");
        let error = backend
            .load(ModelRole::Generation, &ModelSpec::new("llama"))
            .await
            .err()
            .expect("load must fail");
        assert!(matches!(error, ModelError::BackendUnavailable(_)));
    }
}
