use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

use crate::models::ModelRole;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong with the provided value.
        reason: String,
    },
}

/// Which model runtime serves classification, embedding and generation requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackendKind {
    /// Local Ollama runtime reached over HTTP.
    Ollama,
    /// Deterministic in-process backend (hashed embeddings, no completions).
    Local,
}

/// Where chunk embeddings are indexed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreKind {
    /// Process-local store, lost on restart.
    Memory,
    /// Qdrant collection reached over HTTP.
    Qdrant,
}

/// Runtime configuration for the document pipeline and its transports.
#[derive(Clone, Debug, Serialize)]
pub struct Config {
    /// Model runtime used for every role.
    pub model_backend: ModelBackendKind,
    /// Base URL of the Ollama runtime.
    pub ollama_url: String,
    /// Model identifier used for the classification assist.
    pub classifier_model: String,
    /// Model identifier used for markup refinement.
    pub generation_model: String,
    /// Model identifier used for chunk embeddings.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Maximum number of simultaneously loaded model handles.
    pub model_cache_capacity: usize,
    /// Idle time after which a loaded handle is evicted.
    pub model_cache_ttl_secs: u64,
    /// How long an acquirer waits for a free cache slot.
    pub model_cache_acquire_timeout_secs: u64,
    /// Roles loaded eagerly at start-up.
    pub model_warm_roles: Vec<ModelRole>,
    /// Minimum classification confidence; below it documents are rejected.
    pub classifier_confidence_floor: f32,
    /// Whether the classification model may settle ambiguous lexical results.
    pub classifier_model_assist: bool,
    /// Skeleton completeness below which a warning is recorded.
    pub skeleton_completeness_floor: f32,
    /// Minimum quality score for a document to be indexed.
    pub quality_score_floor: f32,
    /// Upper bound on accepted source file size.
    pub max_file_bytes: u64,
    /// Token ceiling per chunk.
    pub chunk_max_tokens: usize,
    /// Chunks below this size are merged with siblings when possible.
    pub chunk_min_tokens: usize,
    /// Token overlap carried between consecutive prose splits.
    pub chunk_overlap_tokens: usize,
    /// Tokenizer name or model identifier used for token counting.
    pub tokenizer: String,
    /// Timeout applied to purely lexical stages.
    pub stage_timeout_lexical_secs: u64,
    /// Timeout applied to stages that may call a model or a store.
    pub stage_timeout_model_secs: u64,
    /// Maximum attempts per tool invocation.
    pub dispatch_max_attempts: u32,
    /// Base delay of the dispatcher's exponential backoff.
    pub dispatch_backoff_ms: u64,
    /// Number of documents processed concurrently by batch ingestion.
    pub worker_concurrency: usize,
    /// Vector store implementation.
    pub vector_store: VectorStoreKind,
    /// Base URL of the Qdrant instance.
    pub qdrant_url: Option<String>,
    /// Name of the Qdrant collection holding chunk vectors.
    pub qdrant_collection_name: Option<String>,
    /// Optional API key required to access Qdrant.
    #[serde(skip_serializing)]
    pub qdrant_api_key: Option<String>,
    /// JSON file backing the document record store; in-memory when unset.
    pub record_store_path: Option<PathBuf>,
    /// JSON reference table of normative codes.
    pub normative_table_path: Option<PathBuf>,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_backend: ModelBackendKind::Local,
            ollama_url: "http://127.0.0.1:11434".into(),
            classifier_model: "llama3.2:3b".into(),
            generation_model: "llama3.1:8b".into(),
            embedding_model: "nomic-embed-text".into(),
            embedding_dimension: 768,
            model_cache_capacity: 3,
            model_cache_ttl_secs: 900,
            model_cache_acquire_timeout_secs: 30,
            model_warm_roles: vec![ModelRole::Embedding],
            classifier_confidence_floor: 0.55,
            classifier_model_assist: true,
            skeleton_completeness_floor: 0.4,
            quality_score_floor: 0.5,
            max_file_bytes: 50 * 1024 * 1024,
            chunk_max_tokens: 384,
            chunk_min_tokens: 96,
            chunk_overlap_tokens: 32,
            tokenizer: "cl100k_base".into(),
            stage_timeout_lexical_secs: 15,
            stage_timeout_model_secs: 180,
            dispatch_max_attempts: 3,
            dispatch_backoff_ms: 250,
            worker_concurrency: 4,
            vector_store: VectorStoreKind::Memory,
            qdrant_url: None,
            qdrant_collection_name: None,
            qdrant_api_key: None,
            record_store_path: None,
            normative_table_path: None,
            server_port: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let reader = EnvReader { lookup };
        let defaults = Self::default();

        let config = Self {
            model_backend: reader.parse_or("MODEL_BACKEND", defaults.model_backend)?,
            ollama_url: reader.string_or("OLLAMA_URL", defaults.ollama_url),
            classifier_model: reader.string_or("CLASSIFIER_MODEL", defaults.classifier_model),
            generation_model: reader.string_or("GENERATION_MODEL", defaults.generation_model),
            embedding_model: reader.string_or("EMBEDDING_MODEL", defaults.embedding_model),
            embedding_dimension: reader
                .parse_or("EMBEDDING_DIMENSION", defaults.embedding_dimension)?,
            model_cache_capacity: reader
                .parse_or("MODEL_CACHE_CAPACITY", defaults.model_cache_capacity)?,
            model_cache_ttl_secs: reader
                .parse_or("MODEL_CACHE_TTL_SECS", defaults.model_cache_ttl_secs)?,
            model_cache_acquire_timeout_secs: reader.parse_or(
                "MODEL_CACHE_ACQUIRE_TIMEOUT_SECS",
                defaults.model_cache_acquire_timeout_secs,
            )?,
            model_warm_roles: match reader.optional("MODEL_WARM_ROLES") {
                Some(raw) => parse_roles(&raw)?,
                None => defaults.model_warm_roles,
            },
            classifier_confidence_floor: reader.fraction_or(
                "CLASSIFIER_CONFIDENCE_FLOOR",
                defaults.classifier_confidence_floor,
            )?,
            classifier_model_assist: reader
                .parse_or("CLASSIFIER_MODEL_ASSIST", defaults.classifier_model_assist)?,
            skeleton_completeness_floor: reader.fraction_or(
                "SKELETON_COMPLETENESS_FLOOR",
                defaults.skeleton_completeness_floor,
            )?,
            quality_score_floor: reader
                .fraction_or("QUALITY_SCORE_FLOOR", defaults.quality_score_floor)?,
            max_file_bytes: reader.parse_or("MAX_FILE_BYTES", defaults.max_file_bytes)?,
            chunk_max_tokens: reader.parse_or("CHUNK_MAX_TOKENS", defaults.chunk_max_tokens)?,
            chunk_min_tokens: reader.parse_or("CHUNK_MIN_TOKENS", defaults.chunk_min_tokens)?,
            chunk_overlap_tokens: reader
                .parse_or("CHUNK_OVERLAP_TOKENS", defaults.chunk_overlap_tokens)?,
            tokenizer: reader.string_or("TOKENIZER", defaults.tokenizer),
            stage_timeout_lexical_secs: reader
                .parse_or("STAGE_TIMEOUT_LEXICAL_SECS", defaults.stage_timeout_lexical_secs)?,
            stage_timeout_model_secs: reader
                .parse_or("STAGE_TIMEOUT_MODEL_SECS", defaults.stage_timeout_model_secs)?,
            dispatch_max_attempts: reader
                .parse_or("DISPATCH_MAX_ATTEMPTS", defaults.dispatch_max_attempts)?,
            dispatch_backoff_ms: reader
                .parse_or("DISPATCH_BACKOFF_MS", defaults.dispatch_backoff_ms)?,
            worker_concurrency: reader
                .parse_or("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            vector_store: reader.parse_or("VECTOR_STORE", defaults.vector_store)?,
            qdrant_url: reader.optional("QDRANT_URL"),
            qdrant_collection_name: reader.optional("QDRANT_COLLECTION_NAME"),
            qdrant_api_key: reader.optional("QDRANT_API_KEY"),
            record_store_path: reader.optional("RECORD_STORE_PATH").map(PathBuf::from),
            normative_table_path: reader.optional("NORMATIVE_TABLE_PATH").map(PathBuf::from),
            server_port: reader
                .optional("SERVER_PORT")
                .map(|value| parse_value::<u16>("SERVER_PORT", &value))
                .transpose()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.vector_store == VectorStoreKind::Qdrant {
            if self.qdrant_url.is_none() {
                return Err(ConfigError::MissingVariable("QDRANT_URL".into()));
            }
            if self.qdrant_collection_name.is_none() {
                return Err(ConfigError::MissingVariable("QDRANT_COLLECTION_NAME".into()));
            }
        }
        if self.model_cache_capacity == 0 {
            return Err(invalid("MODEL_CACHE_CAPACITY", "must be at least 1"));
        }
        if self.embedding_dimension == 0 {
            return Err(invalid("EMBEDDING_DIMENSION", "must be at least 1"));
        }
        if self.chunk_max_tokens == 0 {
            return Err(invalid("CHUNK_MAX_TOKENS", "must be at least 1"));
        }
        if self.chunk_min_tokens > self.chunk_max_tokens {
            return Err(invalid(
                "CHUNK_MIN_TOKENS",
                "must not exceed CHUNK_MAX_TOKENS",
            ));
        }
        if self.chunk_overlap_tokens >= self.chunk_max_tokens {
            return Err(invalid(
                "CHUNK_OVERLAP_TOKENS",
                "must be smaller than CHUNK_MAX_TOKENS",
            ));
        }
        if self.dispatch_max_attempts == 0 {
            return Err(invalid("DISPATCH_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.worker_concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string_or(&self, key: &str, default: String) -> String {
        self.optional(key).unwrap_or(default)
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
    {
        match self.optional(key) {
            Some(value) => parse_value(key, &value),
            None => Ok(default),
        }
    }

    fn fraction_or(&self, key: &str, default: f32) -> Result<f32, ConfigError> {
        let value: f32 = self.parse_or(key, default)?;
        if (0.0..=1.0).contains(&value) {
            Ok(value)
        } else {
            Err(invalid(key, "must lie between 0 and 1"))
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(key, &format!("could not parse `{value}`")))
}

fn parse_roles(raw: &str) -> Result<Vec<ModelRole>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_value::<ModelRole>("MODEL_WARM_ROLES", part))
        .collect()
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

impl FromStr for ModelBackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "local" => Ok(Self::Local),
            _ => Err(()),
        }
    }
}

impl FromStr for VectorStoreKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        model_backend = ?config.model_backend,
        vector_store = ?config.vector_store,
        cache_capacity = config.model_cache_capacity,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = Config::from_lookup(|_| None).expect("defaults are valid");
        assert_eq!(config.model_backend, ModelBackendKind::Local);
        assert_eq!(config.vector_store, VectorStoreKind::Memory);
        assert_eq!(config.dispatch_max_attempts, 3);
        assert_eq!(config.model_warm_roles, vec![ModelRole::Embedding]);
    }

    #[test]
    fn qdrant_requires_url_and_collection() {
        let err = Config::from_lookup(lookup(&[("VECTOR_STORE", "qdrant")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(ref key) if key == "QDRANT_URL"));

        let config = Config::from_lookup(lookup(&[
            ("VECTOR_STORE", "qdrant"),
            ("QDRANT_URL", "http://localhost:6333"),
            ("QDRANT_COLLECTION_NAME", "sitedocs"),
        ]))
        .expect("qdrant config");
        assert_eq!(config.qdrant_collection_name.as_deref(), Some("sitedocs"));
    }

    #[test]
    fn floors_must_be_fractions() {
        let err = Config::from_lookup(lookup(&[("QUALITY_SCORE_FLOOR", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "QUALITY_SCORE_FLOOR"));
    }

    #[test]
    fn warm_roles_are_parsed_from_a_list() {
        let config = Config::from_lookup(lookup(&[(
            "MODEL_WARM_ROLES",
            "embedding, classification",
        )]))
        .expect("roles");
        assert_eq!(
            config.model_warm_roles,
            vec![ModelRole::Embedding, ModelRole::Classification]
        );

        let err = Config::from_lookup(lookup(&[("MODEL_WARM_ROLES", "vision")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn chunk_bounds_are_checked() {
        let err = Config::from_lookup(lookup(&[
            ("CHUNK_MAX_TOKENS", "100"),
            ("CHUNK_OVERLAP_TOKENS", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CHUNK_OVERLAP_TOKENS"));
    }
}
