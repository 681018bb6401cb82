use crate::mcp::ToolDescriptor;
use llm::{SchemaDialect, ToolDefinition};
use serde_json::{json, Map, Value};
use tracing::warn;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchemaConversionError {
    #[error("Tool `{tool}` has no input schema")]
    MissingSchema { tool: String },

    #[error("Tool `{tool}` has a malformed input schema: {reason}")]
    Malformed { tool: String, reason: String },
}

/// Converts a tool descriptor into the declaration sent to the model.
///
/// Every property becomes `{type, description}` with the type name
/// normalized for `dialect` and the description taken from the property's
/// `title`. A schema without properties declares no parameters.
pub fn to_provider_tool(
    descriptor: &ToolDescriptor,
    dialect: SchemaDialect,
) -> Result<ToolDefinition, SchemaConversionError> {
    let malformed = |reason: &str| SchemaConversionError::Malformed {
        tool: descriptor.name.clone(),
        reason: reason.to_string(),
    };

    let schema = match &descriptor.input_schema {
        None | Some(Value::Null) => {
            return Err(SchemaConversionError::MissingSchema {
                tool: descriptor.name.clone(),
            })
        }
        Some(Value::Object(schema)) => schema,
        Some(_) => return Err(malformed("input schema is not an object")),
    };

    let properties = match schema.get("properties") {
        None | Some(Value::Null) => None,
        Some(Value::Object(properties)) => Some(properties),
        Some(_) => return Err(malformed("`properties` is not an object")),
    };

    let required = match schema.get("required") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(|s| Value::String(s.to_string())))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| malformed("`required` must list property names"))?,
        Some(_) => return Err(malformed("`required` is not an array")),
    };

    let parameters = match properties {
        Some(properties) if !properties.is_empty() => {
            let mut converted = Map::new();
            for (key, property) in properties {
                let Value::Object(property) = property else {
                    return Err(malformed(&format!("property `{key}` is not an object")));
                };
                converted.insert(key.clone(), convert_property(property, dialect));
            }
            Some(json!({
                "type": type_name("object", dialect),
                "properties": converted,
                "required": required,
            }))
        }
        _ => None,
    };

    Ok(ToolDefinition {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        parameters,
    })
}

/// Converts all descriptors, leaving out the ones that fail.
pub fn build_declarations(
    descriptors: &[ToolDescriptor],
    dialect: SchemaDialect,
) -> Vec<ToolDefinition> {
    descriptors
        .iter()
        .filter_map(|descriptor| match to_provider_tool(descriptor, dialect) {
            Ok(declaration) => Some(declaration),
            Err(e) => {
                warn!("Omitting tool from declarations: {}", e);
                None
            }
        })
        .collect()
}

fn convert_property(property: &Map<String, Value>, dialect: SchemaDialect) -> Value {
    let canonical = property_type(property);
    let description = property
        .get("title")
        .or_else(|| property.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut converted = json!({
        "type": type_name(canonical, dialect),
        "description": description,
    });

    if canonical == "array" {
        let item_type = property
            .get("items")
            .and_then(Value::as_object)
            .map(property_type)
            .unwrap_or("string");
        converted["items"] = json!({ "type": type_name(item_type, dialect) });
    }

    if let Some(Value::Array(values)) = property.get("enum") {
        if !values.is_empty() && values.iter().all(Value::is_string) {
            converted["enum"] = Value::Array(values.clone());
        }
    }

    converted
}

/// Canonical JSON-schema type of a property.
fn property_type(property: &Map<String, Value>) -> &'static str {
    if let Some(declared) = property.get("type") {
        match declared {
            Value::String(name) => return canonical_type(name),
            Value::Array(names) => {
                if let Some(name) = names
                    .iter()
                    .filter_map(Value::as_str)
                    .find(|name| *name != "null")
                {
                    return canonical_type(name);
                }
            }
            _ => {}
        }
    }

    for combinator in ["anyOf", "oneOf"] {
        if let Some(Value::Array(variants)) = property.get(combinator) {
            let first = variants
                .iter()
                .filter_map(Value::as_object)
                .map(property_type_if_declared)
                .find(|name| matches!(name, Some(name) if *name != "null"));
            if let Some(Some(name)) = first {
                return name;
            }
        }
    }

    "string"
}

fn property_type_if_declared(variant: &Map<String, Value>) -> Option<&'static str> {
    match variant.get("type")? {
        Value::String(name) if name == "null" => Some("null"),
        Value::String(name) => Some(canonical_type(name)),
        _ => None,
    }
}

fn canonical_type(name: &str) -> &'static str {
    match name.to_ascii_lowercase().as_str() {
        "string" | "str" => "string",
        "integer" | "int" => "integer",
        "number" | "float" | "double" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" => "array",
        "object" | "dict" => "object",
        _ => "string",
    }
}

fn type_name(canonical: &str, dialect: SchemaDialect) -> String {
    match dialect {
        SchemaDialect::JsonSchema => canonical.to_string(),
        SchemaDialect::Gemini => canonical.to_ascii_uppercase(),
    }
}
