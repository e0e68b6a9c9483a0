//! Argument validation, retries and panic isolation around tool handlers.

use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use super::envelope::ResultEnvelope;
use super::registry::{ToolError, ToolHandler, ToolOutput, ToolRegistry, ToolSpec};
use crate::retry::RetryPolicy;

/// Executes registered tools and wraps every outcome in a [`ResultEnvelope`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    retry: RetryPolicy,
}

impl Dispatcher {
    /// Dispatcher over `registry` retrying retryable failures per `retry`.
    pub fn new(registry: ToolRegistry, retry: RetryPolicy) -> Self {
        Self {
            registry: Arc::new(registry),
            retry,
        }
    }

    /// Registered tools.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Declarations of every registered tool.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    /// Run tool `name` with `arguments`. Never panics and never returns a raw error.
    pub async fn execute(&self, name: &str, arguments: Value) -> ResultEnvelope {
        let started = Instant::now();
        let Some(handler) = self.registry.get(name) else {
            tracing::info!(tool = name, "Unknown tool requested");
            let error = ToolError::not_found(
                format!("unknown tool `{name}`"),
                "list the available tools and check the name",
            );
            return ResultEnvelope::failed(error, started.elapsed(), 0);
        };

        let arguments = match prepare_arguments(handler.spec(), arguments) {
            Ok(arguments) => arguments,
            Err(error) => {
                tracing::info!(tool = name, error = %error, "Rejected tool arguments");
                return ResultEnvelope::failed(error, started.elapsed(), 0);
            }
        };

        let (result, attempts) = self
            .retry
            .run(
                name,
                |error: &ToolError| error.category.is_retryable(),
                |_| invoke(handler.clone(), arguments.clone()),
            )
            .await;
        let elapsed = started.elapsed();
        match result {
            Ok(output) => {
                tracing::info!(tool = name, attempts, elapsed_ms = elapsed.as_millis() as u64, warnings = output.warnings.len(), "Tool completed");
                ResultEnvelope::completed(output, elapsed, attempts)
            }
            Err(error) => {
                tracing::warn!(tool = name, attempts, category = %error.category, error = %error, "Tool failed");
                ResultEnvelope::failed(error, elapsed, attempts)
            }
        }
    }
}

async fn invoke(
    handler: Arc<dyn ToolHandler>,
    arguments: Map<String, Value>,
) -> Result<ToolOutput, ToolError> {
    // A separate task turns a handler panic into a JoinError instead of unwinding the caller.
    match tokio::spawn(async move { handler.call(arguments).await }).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            let message = panic_message(join_error.into_panic());
            tracing::error!(panic = %message, "Tool handler panicked");
            Err(ToolError::internal(format!("tool handler panicked: {message}")))
        }
        Err(join_error) => Err(ToolError::internal(format!(
            "tool task did not complete: {join_error}"
        ))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Keep declared arguments, check required ones and fill defaults. Undeclared keys are dropped.
pub(crate) fn prepare_arguments(
    spec: &ToolSpec,
    arguments: Value,
) -> Result<Map<String, Value>, ToolError> {
    let mut supplied = match arguments {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(ToolError::validation(
                format!("arguments of `{}` must be a JSON object, got {other}", spec.name),
                "pass the arguments as an object keyed by parameter name",
            ));
        }
    };

    let mut prepared = Map::new();
    for param in &spec.params {
        match supplied.remove(param.name) {
            Some(value) if !value.is_null() => {
                prepared.insert(param.name.to_string(), value);
            }
            _ if param.required => {
                return Err(ToolError::validation(
                    format!("missing required argument `{}`", param.name),
                    format!("provide `{}`: {}", param.name, param.description),
                ));
            }
            _ => {
                if let Some(default) = &param.default {
                    prepared.insert(param.name.to_string(), default.clone());
                }
            }
        }
    }
    if !supplied.is_empty() {
        let dropped: Vec<&String> = supplied.keys().collect();
        tracing::debug!(tool = spec.name, ?dropped, "Ignoring undeclared arguments");
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::{ParamKind, ParamSpec};
    use serde_json::json;

    fn spec() -> ToolSpec {
        ToolSpec {
            name: "process_document",
            description: "test",
            params: vec![
                ParamSpec::required("file", ParamKind::String, "path of the file"),
                ParamSpec::optional("force", ParamKind::Boolean, json!(false), "reprocess"),
            ],
            read_only: false,
        }
    }

    #[test]
    fn defaults_fill_and_extras_drop() {
        let prepared =
            prepare_arguments(&spec(), json!({"file": "a.txt", "colour": "blue"})).expect("valid");
        assert_eq!(prepared.get("force"), Some(&json!(false)));
        assert!(!prepared.contains_key("colour"));
    }

    #[test]
    fn null_required_argument_is_missing() {
        let error = prepare_arguments(&spec(), json!({"file": null})).expect_err("missing");
        assert_eq!(error.category, crate::pipeline::ErrorCategory::Validation);
        assert!(error.suggestion.contains("path of the file"));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        assert!(prepare_arguments(&spec(), json!(["a.txt"])).is_err());
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
    }
}
