//! Tool declarations and the registry the dispatcher resolves names against.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::pipeline::{ErrorCategory, PipelineError, PipelineFailure};

/// JSON type of a tool parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl ParamKind {
    /// JSON schema type name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One declared tool parameter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParamSpec {
    /// Argument name.
    pub name: &'static str,
    /// Expected JSON type.
    pub kind: ParamKind,
    /// Whether the dispatcher rejects calls without it.
    pub required: bool,
    /// Value filled in when an optional argument is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Short description shown to clients.
    pub description: &'static str,
}

impl ParamSpec {
    /// Required parameter.
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            description,
        }
    }

    /// Optional parameter with a default.
    pub fn optional(
        name: &'static str,
        kind: ParamKind,
        default: Value,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: Some(default),
            description,
        }
    }
}

/// Name, description and parameters of a tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    /// Registry key.
    pub name: &'static str,
    /// What the tool does.
    pub description: &'static str,
    /// Declared parameters.
    pub params: Vec<ParamSpec>,
    /// Whether the tool only reads state.
    pub read_only: bool,
}

/// Successful tool result before it is wrapped in an envelope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    /// Payload.
    pub data: Value,
    /// File references.
    pub files: Vec<String>,
    /// Non-fatal remarks.
    pub warnings: Vec<String>,
}

impl ToolOutput {
    /// Output carrying `data` only.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Attach file references.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Attach warnings.
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Failure of a tool call, already categorised.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ToolError {
    /// Error category.
    pub category: ErrorCategory,
    /// What went wrong.
    pub message: String,
    /// Suggested remedy.
    pub suggestion: String,
    /// Structured details, e.g. the document the failure was recorded on.
    pub data: Option<Value>,
}

impl ToolError {
    /// Error with an explicit category.
    pub fn new(
        category: ErrorCategory,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            suggestion: suggestion.into(),
            data: None,
        }
    }

    /// Bad arguments.
    pub fn validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message, suggestion)
    }

    /// Unknown tool or record.
    pub fn not_found(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message, suggestion)
    }

    /// Unexpected failure inside a handler.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::Internal,
            message,
            "check the service logs; report the failure if it persists",
        )
    }

    /// Attach structured details.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<PipelineError> for ToolError {
    fn from(error: PipelineError) -> Self {
        Self::new(error.category(), error.to_string(), error.suggestion())
    }
}

impl From<PipelineFailure> for ToolError {
    fn from(failure: PipelineFailure) -> Self {
        let data = serde_json::json!({
            "document_id": failure.document_id.map(|id| id.to_string()),
            "stage": failure.stage,
        });
        Self::from(failure.source).with_data(data)
    }
}

/// A unit of work callable through the dispatcher.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Declaration used for validation and schema generation.
    fn spec(&self) -> &ToolSpec;

    /// Run the tool. Arguments are already validated and defaulted.
    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError>;
}

/// Explicit name → handler table built at start-up.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its spec name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> &mut Self {
        let name = handler.spec().name;
        if self.tools.insert(name, handler).is_some() {
            tracing::warn!(tool = name, "Replaced previously registered tool");
        }
        self
    }

    /// Builder form of [`ToolRegistry::register`].
    pub fn with(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Handler registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    /// Declarations of every tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|tool| tool.spec().clone()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tool is registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
