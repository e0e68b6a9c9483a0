//! MCP server bootstrap and request forwarding.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::{
        AnnotateAble, CallToolRequestParam, CallToolResult, ListResourcesResult, ListToolsResult,
        RawResource, ReadResourceRequestParam, ReadResourceResult, Resource, ServerCapabilities,
        ServerInfo, Tool, ToolAnnotations,
    },
};
use serde_json::Value;

use super::format::{document_types_payload, envelope_result, json_resource_contents, serialize_json};
use super::schemas;
use crate::metrics::PipelineMetrics;
use crate::tools::{Dispatcher, ToolSpec};

const DOCUMENT_TYPES_URI: &str = "sitedocs://document-types";
const METRICS_URI: &str = "sitedocs://metrics";

/// MCP server exposing the dispatcher's tools over any rmcp transport.
#[derive(Clone)]
pub struct SitedocsMcpServer {
    dispatcher: Dispatcher,
    metrics: Arc<PipelineMetrics>,
}

impl SitedocsMcpServer {
    /// Server forwarding tool calls to `dispatcher`.
    pub fn new(dispatcher: Dispatcher, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            dispatcher,
            metrics,
        }
    }

    fn describe_tools(&self) -> Vec<Tool> {
        self.dispatcher.specs().iter().map(describe_tool).collect()
    }

    fn describe_resources(&self) -> Vec<Resource> {
        let mut document_types = RawResource::new(DOCUMENT_TYPES_URI, "document-types");
        document_types.description = Some("Document categories the classifier can assign".into());

        let mut metrics = RawResource::new(METRICS_URI, "metrics");
        metrics.description = Some("Pipeline counters since start-up".into());

        vec![document_types.no_annotation(), metrics.no_annotation()]
    }
}

fn describe_tool(spec: &ToolSpec) -> Tool {
    let title = title_case(spec.name);
    let annotations = ToolAnnotations::with_title(title.clone())
        .read_only(spec.read_only)
        .destructive(false)
        .idempotent(true)
        .open_world(false);
    Tool {
        name: Cow::Borrowed(spec.name),
        title: Some(title),
        description: Some(Cow::Borrowed(spec.description)),
        input_schema: Arc::new(schemas::input_schema(spec)),
        output_schema: Some(Arc::new(schemas::envelope_output_schema())),
        annotations: Some(annotations),
        icons: None,
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl ServerHandler for SitedocsMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut implementation = rmcp::model::Implementation::from_build_env();
        implementation.name = "sitedocs".to_string();
        implementation.title = Some("Sitedocs MCP".to_string());
        implementation.version = env!("CARGO_PKG_VERSION").to_string();

        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_resources()
                .enable_tools()
                .build(),
            server_info: implementation,
            instructions: Some(
                "Ingest construction documents with process_document, then inspect them with document_status and work_sequence. Every tool answers with a result envelope carrying status, data and, on failure, an error category and suggestion.".into(),
            ),
            ..ServerInfo::default()
        }
    }

    fn list_resources(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        let resources = self.describe_resources();
        std::future::ready(Ok(ListResourcesResult::with_all_items(resources)))
    }

    fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools = self.describe_tools();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        let uri = request.uri;
        let text = match uri.as_str() {
            DOCUMENT_TYPES_URI => Some(serialize_json(&document_types_payload(), &uri)),
            METRICS_URI => Some(serialize_json(&self.metrics.snapshot(), &uri)),
            _ => None,
        };
        std::future::ready(match text {
            Some(text) => Ok(ReadResourceResult {
                contents: vec![json_resource_contents(&uri, text)],
            }),
            None => Err(McpError::invalid_params(
                format!("Unknown resource URI: {uri}"),
                None,
            )),
        })
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let arguments = request.arguments.map(Value::Object).unwrap_or(Value::Null);
            let envelope = self.dispatcher.execute(request.name.as_ref(), arguments).await;
            Ok(envelope_result(&envelope))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_titles_are_readable() {
        assert_eq!(title_case("process_document"), "Process Document");
        assert_eq!(title_case("model_cache_stats"), "Model Cache Stats");
    }
}
