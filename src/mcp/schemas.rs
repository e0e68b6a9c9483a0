//! JSON schema builders for MCP tools, derived from tool parameter declarations.

use schemars::schema_for;
use serde_json::{Map, Value};

use crate::tools::{ParamSpec, ResultEnvelope, ToolSpec};

/// Build the input schema advertised for `spec`.
pub(crate) fn input_schema(spec: &ToolSpec) -> Map<String, Value> {
    let mut properties = Map::new();
    for param in &spec.params {
        properties.insert(param.name.into(), param_schema(param));
    }
    let required: Vec<&str> = spec
        .params
        .iter()
        .filter(|param| param.required)
        .map(|param| param.name)
        .collect();
    finalize_object_schema(properties, &required)
}

/// Output schema shared by every tool: the result envelope.
pub(crate) fn envelope_output_schema() -> Map<String, Value> {
    match serde_json::to_value(schema_for!(ResultEnvelope)) {
        Ok(Value::Object(schema)) => schema,
        _ => Map::new(),
    }
}

fn param_schema(param: &ParamSpec) -> Value {
    let mut schema = Map::new();
    schema.insert("type".into(), Value::String(param.kind.as_str().into()));
    schema.insert(
        "description".into(),
        Value::String(param.description.into()),
    );
    if let Some(default) = &param.default {
        schema.insert("default".into(), default.clone());
    }
    Value::Object(schema)
}

// Undeclared arguments are ignored by the dispatcher, so the schema leaves the object open.
fn finalize_object_schema(properties: Map<String, Value>, required: &[&str]) -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert("type".into(), Value::String("object".into()));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert(
            "required".into(),
            Value::Array(
                required
                    .iter()
                    .map(|&key| Value::String(key.into()))
                    .collect(),
            ),
        );
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ParamKind;
    use serde_json::json;

    #[test]
    fn schema_lists_required_params_and_defaults() {
        let spec = ToolSpec {
            name: "process_document",
            description: "ingest",
            params: vec![
                ParamSpec::required("file", ParamKind::String, "path"),
                ParamSpec::optional("force", ParamKind::Boolean, json!(false), "reprocess"),
            ],
            read_only: false,
        };
        let schema = Value::Object(input_schema(&spec));
        assert_eq!(schema["required"], json!(["file"]));
        assert_eq!(schema["properties"]["force"]["default"], json!(false));
        assert_eq!(schema["properties"]["file"]["type"], "string");
    }

    #[test]
    fn envelope_schema_describes_status_and_category() {
        let schema = Value::Object(envelope_output_schema());
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["status"].is_object());
        assert!(schema["properties"]["error_category"].is_object());
        assert!(
            schema["required"]
                .as_array()
                .is_some_and(|required| required.contains(&json!("attempts")))
        );
    }

    #[test]
    fn parameterless_tools_have_no_required_list() {
        let spec = ToolSpec {
            name: "pipeline_metrics",
            description: "counters",
            params: Vec::new(),
            read_only: true,
        };
        assert!(!input_schema(&spec).contains_key("required"));
    }
}
