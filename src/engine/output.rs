//! Structured-output validation
//!
//! Checks an LLM's JSON payload against a resolved schema by interpreting
//! the field map directly: every declared field must be present with the
//! declared type, list items are checked element-wise, and undeclared
//! fields are rejected.

use crate::ir::ResolvedSchema;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Structured output for schema '{schema}' must be a JSON object, got {actual}")]
    NotAnObject { schema: String, actual: String },

    #[error("Schema '{schema}': missing required field '{field}'")]
    MissingField { schema: String, field: String },

    #[error("Schema '{schema}': unexpected field '{field}'")]
    UnexpectedField { schema: String, field: String },

    #[error("Schema '{schema}': field '{field}' expects {expected}, got {actual}")]
    FieldType {
        schema: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Schema '{schema}': field '{field}' item {index} expects {expected}, got {actual}")]
    ItemType {
        schema: String,
        field: String,
        index: usize,
        expected: String,
        actual: String,
    },
}

/// Validate a payload against a schema, returning the payload on success
pub fn validate_structured_output(
    schema: &ResolvedSchema,
    payload: &Value,
) -> Result<(), OutputError> {
    let object = payload
        .as_object()
        .ok_or_else(|| OutputError::NotAnObject {
            schema: schema.name.clone(),
            actual: type_name(payload).to_string(),
        })?;

    for (name, field) in &schema.fields {
        let value = object.get(name).ok_or_else(|| OutputError::MissingField {
            schema: schema.name.clone(),
            field: name.clone(),
        })?;

        if field.field_type == "list" {
            let items = value.as_array().ok_or_else(|| OutputError::FieldType {
                schema: schema.name.clone(),
                field: name.clone(),
                expected: "list".to_string(),
                actual: type_name(value).to_string(),
            })?;
            let item_type = field.item_type.as_deref().unwrap_or("string");
            for (index, item) in items.iter().enumerate() {
                if !scalar_matches(item_type, item) {
                    return Err(OutputError::ItemType {
                        schema: schema.name.clone(),
                        field: name.clone(),
                        index,
                        expected: item_type.to_string(),
                        actual: type_name(item).to_string(),
                    });
                }
            }
        } else if !scalar_matches(&field.field_type, value) {
            return Err(OutputError::FieldType {
                schema: schema.name.clone(),
                field: name.clone(),
                expected: field.field_type.clone(),
                actual: type_name(value).to_string(),
            });
        }
    }

    for key in object.keys() {
        if !schema.fields.contains_key(key) {
            return Err(OutputError::UnexpectedField {
                schema: schema.name.clone(),
                field: key.clone(),
            });
        }
    }

    Ok(())
}

fn scalar_matches(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
