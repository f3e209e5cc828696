//! Minimal JSON Schema validation for step and workflow payloads.
//!
//! Supports the subset steps actually declare: `type` (single or list),
//! `properties`, `required`, `items` and `enum`. Unknown keywords are
//! ignored, so richer schemas still round-trip into the serialized graph.

use serde_json::Value;

/// A JSON Schema document attached to a step or workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema(Value);

impl Schema {
    pub fn new(document: Value) -> Self {
        Self(document)
    }

    pub fn document(&self) -> &Value {
        &self.0
    }

    /// Validate `value`, returning every violation found.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();
        check(&self.0, value, "$", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

impl From<Value> for Schema {
    fn from(document: Value) -> Self {
        Self(document)
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn check(schema: &Value, value: &Value, at: &str, violations: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(single) => vec![single.as_str()],
            Value::Array(many) => many.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            violations.push(format!("{at}: expected {}", allowed.join(" | ")));
            return;
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            violations.push(format!("{at}: value is not one of the allowed options"));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    violations.push(format!("{at}: missing required property `{key}`"));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, property_schema) in properties {
                if let Some(child) = object.get(key) {
                    check(property_schema, child, &format!("{at}.{key}"), violations);
                }
            }
        }
    }

    if let (Some(items), Some(array)) = (schema.get("items"), value.as_array()) {
        for (index, item) in array.iter().enumerate() {
            check(items, item, &format!("{at}[{index}]"), violations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_schema() -> Schema {
        Schema::new(json!({
            "type": "object",
            "required": ["id", "lines"],
            "properties": {
                "id": { "type": "string" },
                "priority": { "enum": ["low", "high"] },
                "lines": { "type": "array", "items": { "type": "integer" } }
            }
        }))
    }

    #[test]
    fn accepts_valid_document() {
        let value = json!({ "id": "o-1", "priority": "high", "lines": [1, 2] });
        assert!(order_schema().validate(&value).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let value = json!({ "priority": "urgent", "lines": [1, "two"] });
        let violations = order_schema().validate(&value).unwrap_err();
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().any(|v| v.contains("`id`")));
        assert!(violations.iter().any(|v| v.starts_with("$.priority")));
        assert!(violations.iter().any(|v| v.starts_with("$.lines[1]")));
    }

    #[test]
    fn type_lists_and_unknown_keywords() {
        let schema = Schema::new(json!({ "type": ["string", "null"], "format": "email" }));
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!("a@b.c")).is_ok());
        assert!(schema.validate(&json!(3)).is_err());
    }
}
