use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sitedocs::pipeline::ErrorCategory;
use sitedocs::retry::RetryPolicy;
use sitedocs::tools::{
    Dispatcher, EnvelopeStatus, ParamKind, ParamSpec, ToolError, ToolHandler, ToolOutput,
    ToolRegistry, ToolSpec,
};

/// Fails with a fixed category until `failures` calls have been made, then echoes its arguments.
struct ScriptedTool {
    spec: ToolSpec,
    failures: u32,
    category: ErrorCategory,
    calls: AtomicU32,
}

impl ScriptedTool {
    fn new(name: &'static str, failures: u32, category: ErrorCategory) -> Arc<Self> {
        Arc::new(Self {
            spec: ToolSpec {
                name,
                description: "scripted test tool",
                params: vec![
                    ParamSpec::required("file", ParamKind::String, "document path"),
                    ParamSpec::optional("force", ParamKind::Boolean, json!(false), "reprocess"),
                ],
                read_only: false,
            },
            failures,
            category,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolHandler for ScriptedTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ToolError::new(
                self.category,
                format!("scripted failure {call}"),
                "try again later",
            ));
        }
        Ok(ToolOutput::new(Value::Object(arguments)))
    }
}

struct PanickingTool {
    spec: ToolSpec,
}

#[async_trait]
impl ToolHandler for PanickingTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, _arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        panic!("handler exploded");
    }
}

fn dispatcher(tool: Arc<dyn ToolHandler>) -> Dispatcher {
    Dispatcher::new(
        ToolRegistry::new().with(tool),
        RetryPolicy::new(3, Duration::from_millis(1)),
    )
}

#[tokio::test]
async fn backend_failures_are_retried_until_success() {
    let tool = ScriptedTool::new("flaky", 2, ErrorCategory::BackendUnavailable);
    let envelope = dispatcher(tool.clone())
        .execute("flaky", json!({"file": "plan.txt"}))
        .await;

    assert_eq!(envelope.status, EnvelopeStatus::Success);
    assert_eq!(envelope.attempts, 3);
    assert_eq!(tool.calls(), 3);
    assert!(envelope.error_category.is_none());
    assert_eq!(envelope.data["file"], "plan.txt");
}

#[tokio::test]
async fn retries_stop_at_the_attempt_budget() {
    let tool = ScriptedTool::new("down", 10, ErrorCategory::Timeout);
    let envelope = dispatcher(tool.clone())
        .execute("down", json!({"file": "plan.txt"}))
        .await;

    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.attempts, 3);
    assert_eq!(tool.calls(), 3);
    assert_eq!(envelope.error_category, Some(ErrorCategory::Timeout));
    assert_eq!(envelope.suggestion.as_deref(), Some("try again later"));
}

#[tokio::test]
async fn document_level_failures_are_not_retried() {
    for category in [
        ErrorCategory::Validation,
        ErrorCategory::LowConfidence,
        ErrorCategory::QualityGate,
        ErrorCategory::Persistence,
    ] {
        let tool = ScriptedTool::new("strict", 5, category);
        let envelope = dispatcher(tool.clone())
            .execute("strict", json!({"file": "plan.txt"}))
            .await;

        assert_eq!(envelope.status, EnvelopeStatus::Error);
        assert_eq!(envelope.attempts, 1, "{category} was retried");
        assert_eq!(tool.calls(), 1);
        assert_eq!(envelope.error_category, Some(category));
    }
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_handler() {
    let tool = ScriptedTool::new("strict", 0, ErrorCategory::Internal);
    let dispatcher = dispatcher(tool.clone());

    let missing = dispatcher.execute("strict", json!({"force": true})).await;
    assert_eq!(missing.error_category, Some(ErrorCategory::Validation));
    assert_eq!(missing.attempts, 0);
    assert!(missing.suggestion.is_some_and(|s| s.contains("document path")));

    let not_an_object = dispatcher.execute("strict", json!("plan.txt")).await;
    assert_eq!(not_an_object.error_category, Some(ErrorCategory::Validation));
    assert_eq!(tool.calls(), 0);
}

#[tokio::test]
async fn defaults_are_filled_and_undeclared_arguments_dropped() {
    let tool = ScriptedTool::new("echo", 0, ErrorCategory::Internal);
    let envelope = dispatcher(tool)
        .execute("echo", json!({"file": "plan.txt", "colour": "blue"}))
        .await;

    assert_eq!(envelope.status, EnvelopeStatus::Success);
    assert_eq!(envelope.data, json!({"file": "plan.txt", "force": false}));
}

#[tokio::test]
async fn unknown_tools_are_reported_as_not_found() {
    let tool = ScriptedTool::new("echo", 0, ErrorCategory::Internal);
    let envelope = dispatcher(tool).execute("delete_everything", json!({})).await;

    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.error_category, Some(ErrorCategory::NotFound));
    assert_eq!(envelope.attempts, 0);
    assert!(envelope.suggestion.is_some());
}

#[tokio::test]
async fn handler_panics_become_internal_errors() {
    let tool = Arc::new(PanickingTool {
        spec: ToolSpec {
            name: "explode",
            description: "panics",
            params: Vec::new(),
            read_only: true,
        },
    });
    let dispatcher = dispatcher(tool);

    let envelope = dispatcher.execute("explode", Value::Null).await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.error_category, Some(ErrorCategory::Internal));
    assert_eq!(envelope.attempts, 1);
    assert!(
        envelope
            .error
            .as_deref()
            .is_some_and(|error| error.contains("handler exploded"))
    );

    // The dispatcher stays usable after a panic.
    let again = dispatcher.execute("explode", json!({})).await;
    assert_eq!(again.error_category, Some(ErrorCategory::Internal));
}
