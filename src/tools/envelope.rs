//! Uniform result shape returned by every tool invocation.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::registry::{ToolError, ToolOutput};
use crate::pipeline::ErrorCategory;

/// Overall outcome of a tool call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    /// Completed without remarks.
    Success,
    /// Completed, but the output carries warnings.
    Warning,
    /// Did not complete.
    Error,
}

/// What callers receive from [`super::Dispatcher::execute`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResultEnvelope {
    /// Outcome.
    pub status: EnvelopeStatus,
    /// Tool payload; error details when the call failed and the tool provided some.
    pub data: Value,
    /// File references produced or touched by the tool.
    #[serde(default)]
    pub files: Vec<String>,
    /// Non-fatal remarks reported by the tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Wall time spent in the dispatcher, retries included.
    pub execution_time_ms: u64,
    /// Handler invocations made.
    pub attempts: u32,
    /// Category of the final error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Human-readable error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Suggested remedy whenever the status is not `success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ResultEnvelope {
    /// Envelope for a completed call; warnings downgrade the status.
    pub fn completed(output: ToolOutput, elapsed: Duration, attempts: u32) -> Self {
        let (status, suggestion) = if output.warnings.is_empty() {
            (EnvelopeStatus::Success, None)
        } else {
            (
                EnvelopeStatus::Warning,
                Some("review the warnings; the result may be incomplete".to_string()),
            )
        };
        Self {
            status,
            data: output.data,
            files: output.files,
            warnings: output.warnings,
            execution_time_ms: millis(elapsed),
            attempts,
            error_category: None,
            error: None,
            suggestion,
        }
    }

    /// Envelope for a failed call.
    pub fn failed(error: ToolError, elapsed: Duration, attempts: u32) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            data: error.data.unwrap_or(Value::Null),
            files: Vec::new(),
            warnings: Vec::new(),
            execution_time_ms: millis(elapsed),
            attempts,
            error_category: Some(error.category),
            error: Some(error.message),
            suggestion: Some(error.suggestion),
        }
    }

    /// Whether the call completed, with or without warnings.
    pub fn is_ok(&self) -> bool {
        self.status != EnvelopeStatus::Error
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn warnings_downgrade_success() {
        let output = ToolOutput::new(json!({"ok": true})).with_warnings(vec!["one table malformed".into()]);
        let envelope = ResultEnvelope::completed(output, Duration::from_millis(5), 1);
        assert_eq!(envelope.status, EnvelopeStatus::Warning);
        assert!(envelope.suggestion.is_some());
        assert!(envelope.is_ok());
    }

    #[test]
    fn failures_serialize_category_and_suggestion() {
        let envelope = ResultEnvelope::failed(
            ToolError::validation("missing required argument `file`", "provide `file`"),
            Duration::ZERO,
            1,
        );
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["status"], "error");
        assert_eq!(value["error_category"], "validation");
        assert_eq!(value["suggestion"], "provide `file`");
        assert!(value.get("warnings").is_none());
    }
}
