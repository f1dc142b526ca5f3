use castor_schema::RequestPayload;
use serde_json::{Map, Value, json};
use tracing::debug;

/// Appended once to the system instruction when Claude tool hardening is on.
const HARDENING_PARAGRAPH: &str = "When calling tools, use only parameters that are explicitly \
declared in the tool definition. Never invent, rename or guess parameter names or values. Omit \
optional parameters you do not need. If a required value is unknown, ask the user instead of \
fabricating one.";

/// Schema keywords the upstream's declaration validator rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "$ref",
    "$defs",
    "definitions",
    "additionalProperties",
    "unevaluatedProperties",
    "patternProperties",
    "pattern",
    "format",
    "default",
    "examples",
    "title",
    "const",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minItems",
    "maxItems",
    "uniqueItems",
    "minProperties",
    "maxProperties",
];

/// Collapse every tool definition the host sent (Gemini declarations,
/// Anthropic tools, OpenAI function wrappers) into the single
/// `[{functionDeclarations: [...]}]` list the Claude upstream accepts.
/// Returns how many tools arrived without a recoverable schema.
pub fn normalize_claude_tools(payload: &mut RequestPayload) -> u32 {
    let Some(tools_value) = payload.tools.take() else {
        return 0;
    };

    let mut declarations: Vec<Value> = Vec::new();
    let mut missing = 0u32;

    for entry in tools_value.as_array().cloned().unwrap_or_default() {
        for mut declaration in extract_declarations(entry) {
            let name = declaration
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let sanitized = sanitize_tool_name(name);
            declaration["name"] = Value::String(sanitized);

            let schema = declaration
                .get("parameters")
                .or_else(|| declaration.get("input_schema"))
                .cloned();
            let cleaned = match schema {
                Some(schema) if schema.is_object() => clean_schema(schema),
                _ => {
                    missing += 1;
                    Value::Null
                }
            };
            let cleaned = ensure_properties(cleaned);

            if let Some(obj) = declaration.as_object_mut() {
                obj.remove("input_schema");
                obj.insert("parameters".to_string(), cleaned);
            }
            declarations.push(declaration);
        }
    }

    if declarations.is_empty() {
        payload.tools = None;
    } else {
        debug!(count = declarations.len(), "normalized Claude tool declarations");
        payload.tools = Some(json!([{ "functionDeclarations": declarations }]));
    }
    missing
}

/// Pull individual declarations out of whatever wrapper shape arrived.
fn extract_declarations(entry: Value) -> Vec<Value> {
    if let Some(declarations) = entry.get("functionDeclarations").and_then(Value::as_array) {
        return declarations.clone();
    }
    if let Some(function) = entry.get("function") {
        if function.is_object() {
            return vec![function.clone()];
        }
        return Vec::new();
    }
    if entry.get("name").is_some() {
        return vec![entry];
    }
    Vec::new()
}

/// Keep the host's tool list shape for Gemini models, but unwrap `custom`
/// tool wrappers and guarantee an `input_schema` on every entry. Returns
/// the count of tools that needed the empty-schema fallback.
pub fn normalize_gemini_tools(payload: &mut RequestPayload) -> u32 {
    let Some(tools_value) = payload.tools.take() else {
        return 0;
    };
    let Some(entries) = tools_value.as_array() else {
        payload.tools = Some(tools_value);
        return 0;
    };

    let mut missing = 0u32;
    let mut normalized: Vec<Value> = Vec::new();
    for entry in entries {
        let mut tool = match entry.get("custom") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => entry.clone(),
        };

        // Declaration-list entries pass through untouched.
        if tool.get("functionDeclarations").is_some() {
            normalized.push(tool);
            continue;
        }

        if let Some(obj) = tool.as_object_mut() {
            obj.remove("type");
            let has_schema = obj
                .get("input_schema")
                .is_some_and(|schema| schema.is_object());
            if !has_schema {
                missing += 1;
                obj.insert(
                    "input_schema".to_string(),
                    json!({"type": "object", "properties": {}}),
                );
            }
        }
        normalized.push(tool);
    }

    payload.tools = Some(Value::Array(normalized));
    missing
}

/// Append the hardening paragraph and per-tool `STRICT PARAMETERS` lines.
/// Safe to run repeatedly; both additions are deduplicated.
pub fn harden_claude_tools(payload: &mut RequestPayload) {
    let Some(declarations) = payload
        .tools
        .as_mut()
        .and_then(Value::as_array_mut)
        .and_then(|tools| tools.first_mut())
        .and_then(|t| t.get_mut("functionDeclarations"))
        .and_then(Value::as_array_mut)
    else {
        return;
    };

    for declaration in declarations.iter_mut() {
        let params: Vec<String> = declaration
            .pointer("/parameters/properties")
            .and_then(Value::as_object)
            .map(|properties| properties.keys().cloned().collect())
            .unwrap_or_default();
        if params.is_empty() {
            continue;
        }

        let description = declaration
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if description.contains("STRICT PARAMETERS:") {
            continue;
        }
        let line = format!("STRICT PARAMETERS: {}", params.join(", "));
        let next = if description.is_empty() {
            line
        } else {
            format!("{description}\n{line}")
        };
        declaration["description"] = Value::String(next);
    }

    payload.append_system_text(HARDENING_PARAGRAPH);
}

/// `[A-Za-z0-9_-]{1,64}`, with a fixed fallback for names that sanitize to
/// nothing.
fn sanitize_tool_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(64)
        .collect();
    if sanitized.is_empty() {
        "tool".to_string()
    } else {
        sanitized
    }
}

/// Recursively drop schema keywords the upstream rejects.
fn clean_schema(schema: Value) -> Value {
    match schema {
        Value::Object(obj) => {
            let cleaned: Map<String, Value> = obj
                .into_iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key, clean_schema(value)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(clean_schema).collect()),
        other => other,
    }
}

/// The upstream rejects object schemas without properties; synthesize the
/// one-field placeholder.
fn ensure_properties(schema: Value) -> Value {
    let has_properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|properties| !properties.is_empty());
    if has_properties {
        return schema;
    }
    json!({
        "type": "object",
        "properties": {
            "reason": {
                "type": "string",
                "description": "Why this tool is being called"
            }
        },
        "required": ["reason"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_with_tools(tools: Value) -> RequestPayload {
        serde_json::from_value(json!({"contents": [], "tools": tools})).unwrap()
    }

    #[test]
    fn mixed_tool_shapes_collapse_into_one_declaration_list() {
        let mut payload = payload_with_tools(json!([
            {"functionDeclarations": [
                {"name": "read_file", "description": "read", "parameters": {"type": "object", "properties": {"path": {"type": "string"}}}}
            ]},
            {"type": "function", "function": {"name": "write_file", "parameters": {"type": "object", "properties": {"path": {"type": "string"}}}}},
            {"name": "bash", "input_schema": {"type": "object", "properties": {"command": {"type": "string"}}}}
        ]));

        let missing = normalize_claude_tools(&mut payload);
        assert_eq!(missing, 0);

        let tools = payload.tools.as_ref().unwrap().as_array().unwrap();
        assert_eq!(tools.len(), 1);
        let declarations = tools[0]["functionDeclarations"].as_array().unwrap();
        let names: Vec<&str> = declarations
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["read_file", "write_file", "bash"]);
        assert!(declarations.iter().all(|d| d.get("input_schema").is_none()));
    }

    #[test]
    fn rejected_schema_keywords_are_removed_recursively() {
        let mut payload = payload_with_tools(json!([
            {"name": "search", "parameters": {
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "query": {"type": "string", "minLength": 1, "format": "uri"}
                }
            }}
        ]));

        normalize_claude_tools(&mut payload);

        let schema = payload
            .tools
            .as_ref()
            .unwrap()
            .pointer("/0/functionDeclarations/0/parameters")
            .unwrap();
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("additionalProperties").is_none());
        let query = schema.pointer("/properties/query").unwrap();
        assert_eq!(query, &json!({"type": "string"}));
    }

    #[test]
    fn empty_schema_gets_reason_placeholder_and_counts_missing() {
        let mut payload = payload_with_tools(json!([
            {"name": "ping"},
            {"name": "noop", "parameters": {"type": "object", "properties": {}}}
        ]));

        let missing = normalize_claude_tools(&mut payload);
        assert_eq!(missing, 1);

        let declarations = payload
            .tools
            .as_ref()
            .unwrap()
            .pointer("/0/functionDeclarations")
            .unwrap()
            .as_array()
            .unwrap();
        for declaration in declarations {
            assert_eq!(
                declaration.pointer("/parameters/required"),
                Some(&json!(["reason"]))
            );
        }
    }

    #[test]
    fn tool_names_are_sanitized() {
        let mut payload = payload_with_tools(json!([
            {"name": "my tool!with@bad#chars", "parameters": {"type": "object", "properties": {"x": {"type": "string"}}}}
        ]));

        normalize_claude_tools(&mut payload);
        assert_eq!(
            payload
                .tools
                .as_ref()
                .unwrap()
                .pointer("/0/functionDeclarations/0/name"),
            Some(&json!("mytoolwithbadchars"))
        );
    }

    #[test]
    fn gemini_custom_wrapper_is_unwrapped_with_schema_fallback() {
        let mut payload = payload_with_tools(json!([
            {"type": "custom", "custom": {"name": "probe"}},
            {"name": "ready", "input_schema": {"type": "object", "properties": {"x": {"type": "number"}}}}
        ]));

        let missing = normalize_gemini_tools(&mut payload);
        assert_eq!(missing, 1);

        let tools = payload.tools.as_ref().unwrap().as_array().unwrap();
        assert_eq!(tools[0]["name"], json!("probe"));
        assert_eq!(
            tools[0]["input_schema"],
            json!({"type": "object", "properties": {}})
        );
        assert_eq!(
            tools[1]["input_schema"],
            json!({"type": "object", "properties": {"x": {"type": "number"}}})
        );
    }

    #[test]
    fn hardening_appends_strict_parameters_once() {
        let mut payload = payload_with_tools(json!([
            {"name": "run", "description": "Run a command", "parameters": {
                "type": "object",
                "properties": {"command": {"type": "string"}, "cwd": {"type": "string"}}
            }}
        ]));
        normalize_claude_tools(&mut payload);

        harden_claude_tools(&mut payload);
        harden_claude_tools(&mut payload);

        let description = payload
            .tools
            .as_ref()
            .unwrap()
            .pointer("/0/functionDeclarations/0/description")
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(description.matches("STRICT PARAMETERS:").count(), 1);
        assert!(description.contains("command, cwd"));

        let system = payload.system_text().unwrap();
        assert_eq!(system.matches("Never invent, rename").count(), 1);
    }
}
