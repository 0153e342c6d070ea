//! Input schemas and validation.
//!
//! [`JsonSchema`] covers the subset of JSON Schema that command inputs use in
//! practice: `type`, `properties`, `required`, `additionalProperties`, `items`,
//! `enum`, numeric bounds, string length bounds and `pattern`. It deserializes from
//! (and serializes to) ordinary JSON Schema documents, so schemas can be shipped to
//! remote callers in the handshake.
//!
//! [`validate`] is deterministic: for the same schema and input it reports the same
//! violations in the same order.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::CommandError;

/// JSON type keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl SchemaType {
    fn matches(self, value: &Value) -> bool {
        match self {
            SchemaType::Object => value.is_object(),
            SchemaType::Array => value.is_array(),
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Null => value.is_null(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Null => "null",
        }
    }
}

/// A command's input schema. The default schema accepts any value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JsonSchema {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, JsonSchema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<JsonSchema>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl JsonSchema {
    /// Accepts any value.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_type(schema_type: SchemaType) -> Self {
        Self {
            schema_type: Some(schema_type),
            ..Self::default()
        }
    }

    pub fn object() -> Self {
        Self::of_type(SchemaType::Object)
    }

    pub fn string() -> Self {
        Self::of_type(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::of_type(SchemaType::Number)
    }

    pub fn integer() -> Self {
        Self::of_type(SchemaType::Integer)
    }

    pub fn boolean() -> Self {
        Self::of_type(SchemaType::Boolean)
    }

    pub fn array(items: JsonSchema) -> Self {
        Self {
            schema_type: Some(SchemaType::Array),
            items: Some(Box::new(items)),
            ..Self::default()
        }
    }

    /// Parse a JSON Schema document.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Add an optional property.
    pub fn property(mut self, name: impl Into<String>, schema: JsonSchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Add a required property.
    pub fn required_property(mut self, name: impl Into<String>, schema: JsonSchema) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    /// Reject object keys not declared in `properties`.
    pub fn deny_additional(mut self) -> Self {
        self.additional_properties = Some(false);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    pub fn with_maximum(mut self, maximum: f64) -> Self {
        self.maximum = Some(maximum);
        self
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = Some(min_length);
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// One schema violation. `path` is a JSONPath-like location (`$`, `$.title`,
/// `$.tags[2]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Violation>,
}

impl ValidationReport {
    /// `VALIDATION_ERROR` naming the first violation, with every violation in
    /// `details.violations`. `None` when the input was valid.
    pub fn to_error(&self) -> Option<CommandError> {
        let first = self.errors.first()?;
        Some(
            CommandError::validation(format!("Invalid input at {}", first))
                .with_detail("violations", json!(self.errors)),
        )
    }
}

/// Validate `input` against `schema`.
pub fn validate(schema: &JsonSchema, input: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    check(schema, input, "$", &mut errors);
    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

fn check(schema: &JsonSchema, value: &Value, path: &str, errors: &mut Vec<Violation>) {
    let mut fail = |message: String| {
        errors.push(Violation {
            path: path.to_string(),
            message,
        })
    };

    if let Some(expected) = schema.schema_type {
        if !expected.matches(value) {
            fail(format!(
                "expected {}, got {}",
                expected.name(),
                json_type_name(value)
            ));
            // Nothing below makes sense for the wrong type.
            return;
        }
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(value) {
            fail(format!("must be one of {}", Value::Array(allowed.clone())));
        }
    }

    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                if let Some(min) = schema.minimum {
                    if v < min {
                        fail(format!("must be >= {}", min));
                    }
                }
                if let Some(max) = schema.maximum {
                    if v > max {
                        fail(format!("must be <= {}", max));
                    }
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count();
            if let Some(min) = schema.min_length {
                if len < min {
                    fail(format!("must be at least {} characters", min));
                }
            }
            if let Some(max) = schema.max_length {
                if len > max {
                    fail(format!("must be at most {} characters", max));
                }
            }
            if let Some(pattern) = &schema.pattern {
                match Regex::new(pattern) {
                    Ok(re) if re.is_match(s) => {}
                    Ok(_) => fail(format!("must match pattern '{}'", pattern)),
                    Err(_) => fail(format!("schema pattern '{}' is invalid", pattern)),
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{}]", path, i), errors);
                }
            }
        }
        Value::Object(map) => {
            for name in &schema.required {
                if !map.contains_key(name) {
                    errors.push(Violation {
                        path: format!("{}.{}", path, name),
                        message: "is required".to_string(),
                    });
                }
            }
            for (name, prop_schema) in &schema.properties {
                if let Some(prop) = map.get(name) {
                    check(prop_schema, prop, &format!("{}.{}", path, name), errors);
                }
            }
            if schema.additional_properties == Some(false) {
                let mut extra: Vec<&String> = map
                    .keys()
                    .filter(|k| !schema.properties.contains_key(*k))
                    .collect();
                extra.sort();
                for name in extra {
                    errors.push(Violation {
                        path: format!("{}.{}", path, name),
                        message: "is not an allowed property".to_string(),
                    });
                }
            }
        }
        _ => {}
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::codes;

    fn todo_schema() -> JsonSchema {
        JsonSchema::object()
            .required_property("title", JsonSchema::string().with_min_length(1))
            .property(
                "priority",
                JsonSchema::string().with_enum(vec![json!("low"), json!("high")]),
            )
            .property("tags", JsonSchema::array(JsonSchema::string()))
            .property("estimate", JsonSchema::integer().with_minimum(0.0))
            .deny_additional()
    }

    #[test]
    fn test_any_accepts_everything() {
        let schema = JsonSchema::any();
        for value in [json!(null), json!(1), json!("x"), json!({"a": [1]})] {
            assert!(validate(&schema, &value).valid);
        }
    }

    #[test]
    fn test_valid_object() {
        let report = validate(
            &todo_schema(),
            &json!({"title": "ship", "priority": "high", "tags": ["a"], "estimate": 3}),
        );
        assert!(report.valid);
        assert!(report.to_error().is_none());
    }

    #[test]
    fn test_type_mismatch_stops_descent() {
        let report = validate(&todo_schema(), &json!([1, 2]));
        assert_eq!(
            report.errors,
            vec![Violation {
                path: "$".into(),
                message: "expected object, got array".into()
            }]
        );
    }

    #[test]
    fn test_violations_are_ordered() {
        let input = json!({
            "priority": "urgent",
            "tags": ["ok", 7],
            "estimate": -1,
            "zzz": true,
            "aaa": 1
        });
        let report = validate(&todo_schema(), &input);
        let paths: Vec<&str> = report.errors.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "$.title",
                "$.estimate",
                "$.priority",
                "$.tags[1]",
                "$.aaa",
                "$.zzz"
            ]
        );

        // Same input, same report.
        assert_eq!(report, validate(&todo_schema(), &input));
    }

    #[test]
    fn test_report_to_error() {
        let report = validate(&todo_schema(), &json!({}));
        let err = report.to_error().unwrap();
        assert_eq!(err.code, codes::VALIDATION_ERROR);
        assert_eq!(err.message, "Invalid input at $.title: is required");
        assert_eq!(
            err.detail("violations"),
            Some(&json!([{"path": "$.title", "message": "is required"}]))
        );
    }

    #[test]
    fn test_integer_accepts_whole_floats() {
        let schema = JsonSchema::integer();
        assert!(validate(&schema, &json!(4)).valid);
        assert!(validate(&schema, &json!(4.0)).valid);
        assert!(!validate(&schema, &json!(4.5)).valid);
    }

    #[test]
    fn test_string_bounds_and_pattern() {
        let schema = JsonSchema::string()
            .with_max_length(3)
            .with_pattern("^[a-z]+$");
        assert!(validate(&schema, &json!("abc")).valid);

        let report = validate(&schema, &json!("ABCD"));
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].message, "must be at most 3 characters");
    }

    #[test]
    fn test_parse_from_json_schema_document() {
        let schema = JsonSchema::from_value(json!({
            "type": "object",
            "properties": {"v": {"type": "number", "maximum": 10}},
            "required": ["v"],
            "additionalProperties": false
        }))
        .unwrap();
        assert!(validate(&schema, &json!({"v": 1})).valid);
        assert!(!validate(&schema, &json!({"v": 11})).valid);
        assert!(!validate(&schema, &json!({"v": 1, "w": 2})).valid);

        let back = serde_json::to_value(&schema).unwrap();
        assert_eq!(back["additionalProperties"], json!(false));
        assert_eq!(back["required"], json!(["v"]));
    }
}
