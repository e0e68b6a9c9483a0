//! Model roles, backends and the bounded model cache.
//!
//! Every model consumer in the pipeline goes through [`ModelCache::acquire`]. The cache keeps at
//! most `capacity` models loaded, shares a loaded model between concurrent users of the same
//! role, and unloads idle models on least-recently-used order or after the idle TTL.

mod backend;
mod cache;
mod local;
mod ollama;
mod registry;

pub use backend::{LoadedModel, ModelBackend, ModelError};
pub use cache::{CacheSettings, CacheStats, LoadedModelInfo, ModelCache, ModelHandle, RoleUsage};
pub use local::LocalBackend;
pub use ollama::OllamaBackend;
pub use registry::{ModelRegistry, ModelRole, ModelSpec};
