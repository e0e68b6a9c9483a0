//! Tools exposed by every transport.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::registry::{ParamKind, ParamSpec, ToolError, ToolHandler, ToolOutput, ToolRegistry, ToolSpec};
use crate::metrics::PipelineMetrics;
use crate::models::ModelCache;
use crate::normative::NormativeResolver;
use crate::pipeline::{DocumentId, Pipeline, PipelineError, ProcessOptions};
use crate::stores::GraphStore;

/// Registry with every built-in tool wired to `pipeline` and its collaborators.
pub fn builtin_registry(pipeline: &Pipeline) -> ToolRegistry {
    let deps = pipeline.deps();
    ToolRegistry::new()
        .with(Arc::new(ProcessDocumentTool::new(pipeline.clone())))
        .with(Arc::new(DocumentStatusTool::new(pipeline.clone())))
        .with(Arc::new(WorkSequenceTool::new(deps.graph.clone())))
        .with(Arc::new(NormativeStatusTool::new(deps.resolver.clone())))
        .with(Arc::new(ModelCacheStatsTool::new(deps.cache.clone())))
        .with(Arc::new(PipelineMetricsTool::new(deps.metrics.clone())))
}

fn string_arg<'a>(arguments: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ToolError::validation(
                format!("`{name}` must be a non-empty string"),
                format!("pass `{name}` as a string"),
            )
        })
}

fn document_id_arg(arguments: &Map<String, Value>) -> Result<DocumentId, ToolError> {
    let raw = string_arg(arguments, "document_id")?;
    DocumentId::from_str(raw).map_err(|error| {
        ToolError::validation(
            format!("`{raw}` is not a document id: {error}"),
            "use the `id` returned by process_document",
        )
    })
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value)
        .map_err(|error| ToolError::internal(format!("failed to serialize tool output: {error}")))
}

/// Runs the pipeline on one file.
pub struct ProcessDocumentTool {
    pipeline: Pipeline,
    spec: ToolSpec,
}

impl ProcessDocumentTool {
    /// Tool driving `pipeline`.
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            spec: ToolSpec {
                name: "process_document",
                description: "Classify, validate, chunk and index one construction document. Identical content already indexed is returned without reprocessing.",
                params: vec![
                    ParamSpec::required("file", ParamKind::String, "path of the file to ingest"),
                    ParamSpec::optional(
                        "force",
                        ParamKind::Boolean,
                        json!(false),
                        "reprocess even when identical content is already indexed",
                    ),
                ],
                read_only: false,
            },
        }
    }
}

#[async_trait]
impl ToolHandler for ProcessDocumentTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let file = string_arg(&arguments, "file")?;
        let force = arguments
            .get("force")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let options = ProcessOptions {
            force,
            ..ProcessOptions::default()
        };
        let record = self.pipeline.process(Path::new(file), options).await?;
        let warnings = record.warnings.clone();
        Ok(ToolOutput::new(to_data(&record)?)
            .with_files(vec![record.source_path.clone()])
            .with_warnings(warnings))
    }
}

/// Reads a document record.
pub struct DocumentStatusTool {
    pipeline: Pipeline,
    spec: ToolSpec,
}

impl DocumentStatusTool {
    /// Tool reading records through `pipeline`.
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            spec: ToolSpec {
                name: "document_status",
                description: "Current status, warnings and failure details of a document.",
                params: vec![ParamSpec::required(
                    "document_id",
                    ParamKind::String,
                    "document id returned by process_document",
                )],
                read_only: true,
            },
        }
    }
}

#[async_trait]
impl ToolHandler for DocumentStatusTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let id = document_id_arg(&arguments)?;
        let record = self.pipeline.status(id).await?;
        Ok(ToolOutput::new(to_data(&record)?))
    }
}

/// Reads a persisted work sequence.
pub struct WorkSequenceTool {
    graph: Arc<dyn GraphStore>,
    spec: ToolSpec,
}

impl WorkSequenceTool {
    /// Tool reading from `graph`.
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            spec: ToolSpec {
                name: "work_sequence",
                description: "Ordered work items with dependencies and estimated durations of a project document.",
                params: vec![ParamSpec::required(
                    "document_id",
                    ParamKind::String,
                    "document id returned by process_document",
                )],
                read_only: true,
            },
        }
    }
}

#[async_trait]
impl ToolHandler for WorkSequenceTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let id = document_id_arg(&arguments)?;
        let sequence = self
            .graph
            .work_sequence(id)
            .await
            .map_err(PipelineError::from)?
            .ok_or_else(|| {
                ToolError::not_found(
                    format!("no work sequence stored for document {id}"),
                    "only indexed project documents with work items have a sequence",
                )
            })?;
        let warnings = sequence.warnings.clone();
        Ok(ToolOutput::new(to_data(&sequence)?).with_warnings(warnings))
    }
}

/// Checks whether a normative code is in force.
pub struct NormativeStatusTool {
    resolver: Arc<NormativeResolver>,
    spec: ToolSpec,
}

impl NormativeStatusTool {
    /// Tool asking `resolver`.
    pub fn new(resolver: Arc<NormativeResolver>) -> Self {
        Self {
            resolver,
            spec: ToolSpec {
                name: "normative_status",
                description: "Whether a building code or standard is current, with its replacement chain.",
                params: vec![ParamSpec::required(
                    "code",
                    ParamKind::String,
                    "normative code, e.g. SP 70.13330.2012",
                )],
                read_only: true,
            },
        }
    }
}

#[async_trait]
impl ToolHandler for NormativeStatusTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let code = string_arg(&arguments, "code")?;
        let check = self
            .resolver
            .is_current(code)
            .await
            .map_err(PipelineError::from)?;
        let mut warnings = Vec::new();
        if !check.is_current() {
            warnings.push(match &check.replacement {
                Some(replacement) => format!("{} is replaced by {replacement}", check.code),
                None => format!("{} is withdrawn", check.code),
            });
        }
        Ok(ToolOutput::new(to_data(&check)?).with_warnings(warnings))
    }
}

/// Reports loaded models and per-role usage.
pub struct ModelCacheStatsTool {
    cache: ModelCache,
    spec: ToolSpec,
}

impl ModelCacheStatsTool {
    /// Tool reading `cache`.
    pub fn new(cache: ModelCache) -> Self {
        Self {
            cache,
            spec: ToolSpec {
                name: "model_cache_stats",
                description: "Loaded model handles, capacity and per-role usage.",
                params: Vec::new(),
                read_only: true,
            },
        }
    }
}

#[async_trait]
impl ToolHandler for ModelCacheStatsTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, _arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::new(to_data(&self.cache.stats())?))
    }
}

/// Reports pipeline counters.
pub struct PipelineMetricsTool {
    metrics: Arc<PipelineMetrics>,
    spec: ToolSpec,
}

impl PipelineMetricsTool {
    /// Tool reading `metrics`.
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            metrics,
            spec: ToolSpec {
                name: "pipeline_metrics",
                description: "Document and chunk counters since start-up.",
                params: Vec::new(),
                read_only: true,
            },
        }
    }
}

#[async_trait]
impl ToolHandler for PipelineMetricsTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, _arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::new(to_data(&self.metrics.snapshot())?))
    }
}
