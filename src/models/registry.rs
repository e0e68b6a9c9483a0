use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::ModelError;

/// Purpose a model is loaded for. Each role maps to exactly one model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Settles ambiguous document type decisions.
    Classification,
    /// Produces chunk vectors for indexing.
    Embedding,
    /// Refines markup graphs.
    Generation,
}

impl ModelRole {
    /// Every role, in a stable order.
    pub const ALL: [ModelRole; 3] = [Self::Classification, Self::Embedding, Self::Generation];

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Embedding => "embedding",
            Self::Generation => "generation",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "classification" | "classifier" => Ok(Self::Classification),
            "embedding" | "embeddings" => Ok(Self::Embedding),
            "generation" | "generator" => Ok(Self::Generation),
            _ => Err(()),
        }
    }
}

/// Model assigned to a role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    /// Backend-specific model identifier.
    pub model_id: String,
    /// Priority models are loaded at start-up.
    pub priority: bool,
}

impl ModelSpec {
    /// Spec for a model that is loaded on first use.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            priority: false,
        }
    }

    /// Mark the model for eager loading.
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }
}

/// Explicit role to model mapping handed to the cache at construction.
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    specs: HashMap<ModelRole, ModelSpec>,
}

impl ModelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the model for a role.
    pub fn with(mut self, role: ModelRole, spec: ModelSpec) -> Self {
        self.specs.insert(role, spec);
        self
    }

    /// Model assigned to `role`.
    pub fn spec(&self, role: ModelRole) -> Result<&ModelSpec, ModelError> {
        self.specs.get(&role).ok_or(ModelError::Unregistered(role))
    }

    /// Roles whose models are loaded eagerly, in stable order.
    pub fn priority_roles(&self) -> Vec<ModelRole> {
        ModelRole::ALL
            .into_iter()
            .filter(|role| self.specs.get(role).is_some_and(|spec| spec.priority))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_roles_follow_role_order() {
        let registry = ModelRegistry::new()
            .with(ModelRole::Generation, ModelSpec::new("gen").priority())
            .with(ModelRole::Embedding, ModelSpec::new("embed").priority())
            .with(ModelRole::Classification, ModelSpec::new("cls"));

        assert_eq!(
            registry.priority_roles(),
            vec![ModelRole::Embedding, ModelRole::Generation]
        );
    }

    #[test]
    fn unregistered_roles_are_reported() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.spec(ModelRole::Embedding),
            Err(ModelError::Unregistered(ModelRole::Embedding))
        ));
    }

    #[test]
    fn roles_parse_from_aliases() {
        assert_eq!("Embeddings".parse(), Ok(ModelRole::Embedding));
        assert_eq!("classifier".parse(), Ok(ModelRole::Classification));
        assert!("vision".parse::<ModelRole>().is_err());
    }
}
