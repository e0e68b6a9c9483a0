//! Formatting helpers shared by MCP tool results and resources.

use rmcp::model::{CallToolResult, ResourceContents};
use serde::Serialize;
use serde_json::{Value, json};

use crate::pipeline::DocumentType;
use crate::tools::ResultEnvelope;

pub(crate) const APPLICATION_JSON: &str = "application/json";

/// Wrap a dispatcher envelope as structured tool content; failed calls set `is_error`.
pub(crate) fn envelope_result(envelope: &ResultEnvelope) -> CallToolResult {
    let payload = serde_json::to_value(envelope).unwrap_or_else(|error| {
        tracing::warn!(%error, "Failed to serialize result envelope");
        json!({ "status": "error", "error": "result envelope could not be serialized" })
    });
    if envelope.is_ok() {
        CallToolResult::structured(payload)
    } else {
        CallToolResult::structured_error(payload)
    }
}

/// Document taxonomy published as a resource.
pub(crate) fn document_types_payload() -> Value {
    json!({
        "document_types": DocumentType::ALL
            .iter()
            .map(|doc_type| doc_type.as_str())
            .collect::<Vec<_>>(),
    })
}

/// Serialize a value to JSON, falling back to compact formatting on error.
pub(crate) fn serialize_json<T: Serialize>(value: &T, context_uri: &str) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|error| {
        tracing::warn!(uri = context_uri, %error, "Failed to serialize JSON prettily");
        serde_json::to_string(value).unwrap_or_else(|_| "{}".into())
    })
}

/// Build JSON resource contents for MCP resource responses.
pub(crate) fn json_resource_contents(uri: &str, text: String) -> ResourceContents {
    ResourceContents::TextResourceContents {
        uri: uri.to_string(),
        mime_type: Some(APPLICATION_JSON.into()),
        text,
        meta: None,
    }
}
