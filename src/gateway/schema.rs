use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{GatewayError, Result};

/// Declared shape of a request body. Stored on the API version and applied to
/// every inbound payload; closed tagged union, no reflection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodySchema {
    Boolean,
    Number,
    String,
    Array { items: Box<BodySchema> },
    Object { children: Vec<SchemaField> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaField {
    pub key: String,
    #[serde(flatten)]
    pub schema: BodySchema,
}

impl BodySchema {
    fn expected(&self) -> &'static str {
        match self {
            BodySchema::Boolean => "boolean",
            BodySchema::Number => "number",
            BodySchema::String => "string",
            BodySchema::Array { .. } => "array",
            BodySchema::Object { .. } => "object",
        }
    }
}

pub fn validate(value: &Value, schema: &BodySchema) -> Result<()> {
    validate_at(value, schema, "body")
}

fn validate_at(value: &Value, schema: &BodySchema, path: &str) -> Result<()> {
    match schema {
        BodySchema::Boolean if value.is_boolean() => Ok(()),
        BodySchema::Number if value.is_number() => Ok(()),
        BodySchema::String if value.is_string() => Ok(()),
        BodySchema::Array { items } => {
            let Some(elements) = value.as_array() else {
                return Err(mismatch(value, schema, path));
            };
            for (index, element) in elements.iter().enumerate() {
                validate_at(element, items, &format!("{path}[{index}]"))?;
            }
            Ok(())
        }
        BodySchema::Object { children } => {
            let Some(object) = value.as_object() else {
                return Err(mismatch(value, schema, path));
            };
            for child in children {
                let Some(inner) = object.get(&child.key) else {
                    return Err(GatewayError::InvalidRequest {
                        reason: format!("missing required key `{}` in object at {path}", child.key),
                    });
                };
                validate_at(inner, &child.schema, &format!("{path}.{}", child.key))?;
            }
            Ok(())
        }
        _ => Err(mismatch(value, schema, path)),
    }
}

fn mismatch(value: &Value, schema: &BodySchema, path: &str) -> GatewayError {
    GatewayError::InvalidRequest {
        reason: format!(
            "value {value} at {path} does not match expected type {}",
            schema.expected()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn age_schema() -> BodySchema {
        serde_json::from_value(json!({
            "type": "object",
            "children": [{"key": "age", "type": "number"}]
        }))
        .expect("schema")
    }

    #[test]
    fn number_field_rejects_string_value_naming_the_path() {
        let err = validate(&json!({"age": "12"}), &age_schema()).unwrap_err();
        let reason = err.to_string();
        assert!(reason.contains("body.age"), "{reason}");
        assert!(reason.contains("number"), "{reason}");
    }

    #[test]
    fn number_field_accepts_number_value() {
        validate(&json!({"age": 12}), &age_schema()).expect("valid");
    }

    #[test]
    fn missing_declared_key_is_named() {
        let err = validate(&json!({}), &age_schema()).unwrap_err();
        assert!(err.to_string().contains("`age`"));
    }

    #[test]
    fn extra_keys_are_tolerated() {
        validate(&json!({"age": 3, "name": "x"}), &age_schema()).expect("valid");
    }

    #[test]
    fn array_elements_validate_against_the_item_schema() {
        let schema: BodySchema = serde_json::from_value(json!({
            "type": "array",
            "items": {"type": "string"}
        }))
        .expect("schema");

        validate(&json!(["a", "b"]), &schema).expect("valid");
        let err = validate(&json!(["a", 4]), &schema).unwrap_err();
        assert!(err.to_string().contains("body[1]"));
    }

    #[test]
    fn nested_objects_validate_recursively() {
        let schema: BodySchema = serde_json::from_value(json!({
            "type": "object",
            "children": [{
                "key": "item",
                "type": "object",
                "children": [{"key": "active", "type": "boolean"}]
            }]
        }))
        .expect("schema");

        validate(&json!({"item": {"active": true}}), &schema).expect("valid");
        let err = validate(&json!({"item": {"active": "yes"}}), &schema).unwrap_err();
        assert!(err.to_string().contains("body.item.active"));
    }
}
