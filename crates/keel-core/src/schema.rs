//! OpenAPI v3 subset validation for resource specs.
//!
//! A pure, deterministic checker: no network I/O, no references. Supported
//! keywords: `type` (object, array, string, integer, number, boolean),
//! `required`, `enum`, `minimum`/`maximum`, `minLength`/`maxLength`,
//! `pattern`, `items`, `properties`, `additionalProperties`, and `default`.
//! Defaults are applied top-down to missing keys before validation, and the
//! defaulted document is returned on success.

use regex::Regex;
use serde_json::{Map, Value};

const SUPPORTED_TYPES: &[&str] = &["object", "array", "string", "integer", "number", "boolean"];

/// One validation failure, addressed by a dotted path into the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `doc` against `schema`, returning the document with defaults
/// applied, or every violation found.
pub fn validate(schema: &Value, doc: &Value) -> Result<Value, Vec<SchemaViolation>> {
    let mut doc = doc.clone();
    apply_defaults(schema, &mut doc);

    let mut violations = Vec::new();
    validate_value(schema, &doc, "(root)", &mut violations);

    if violations.is_empty() {
        Ok(doc)
    } else {
        Err(violations)
    }
}

/// Structurally check that `schema` itself stays within the supported
/// subset. Used when a resource type is registered, so bad schemas are
/// rejected up front instead of failing every spec they later see.
pub fn check_schema(schema: &Value) -> Result<(), Vec<SchemaViolation>> {
    let mut violations = Vec::new();
    check_schema_node(schema, "(root)", &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn check_schema_node(schema: &Value, path: &str, violations: &mut Vec<SchemaViolation>) {
    let Some(obj) = schema.as_object() else {
        violations.push(SchemaViolation::new(path, "schema must be an object"));
        return;
    };

    if let Some(ty) = obj.get("type") {
        match ty.as_str() {
            Some(name) if SUPPORTED_TYPES.contains(&name) => {}
            Some(name) => violations.push(SchemaViolation::new(
                path,
                format!("unsupported type '{name}'"),
            )),
            None => violations.push(SchemaViolation::new(path, "'type' must be a string")),
        }
    }

    if let Some(required) = obj.get("required") {
        match required.as_array() {
            Some(items) if items.iter().all(Value::is_string) => {}
            _ => violations.push(SchemaViolation::new(
                path,
                "'required' must be an array of strings",
            )),
        }
    }

    if let Some(choices) = obj.get("enum") {
        if !choices.is_array() {
            violations.push(SchemaViolation::new(path, "'enum' must be an array"));
        }
    }

    for bound in ["minimum", "maximum"] {
        if let Some(v) = obj.get(bound) {
            if !v.is_number() {
                violations.push(SchemaViolation::new(path, format!("'{bound}' must be a number")));
            }
        }
    }

    for bound in ["minLength", "maxLength"] {
        if let Some(v) = obj.get(bound) {
            if !v.is_u64() {
                violations.push(SchemaViolation::new(
                    path,
                    format!("'{bound}' must be a non-negative integer"),
                ));
            }
        }
    }

    if let Some(pattern) = obj.get("pattern") {
        match pattern.as_str() {
            Some(p) => {
                if Regex::new(p).is_err() {
                    violations.push(SchemaViolation::new(
                        path,
                        format!("'pattern' is not a valid regex: {p}"),
                    ));
                }
            }
            None => violations.push(SchemaViolation::new(path, "'pattern' must be a string")),
        }
    }

    if let Some(items) = obj.get("items") {
        check_schema_node(items, &child_path(path, "items"), violations);
    }

    if let Some(props) = obj.get("properties") {
        match props.as_object() {
            Some(map) => {
                for (name, sub) in map {
                    check_schema_node(sub, &child_path(path, name), violations);
                }
            }
            None => violations.push(SchemaViolation::new(path, "'properties' must be an object")),
        }
    }

    if let Some(additional) = obj.get("additionalProperties") {
        if !additional.is_boolean() && !additional.is_object() {
            violations.push(SchemaViolation::new(
                path,
                "'additionalProperties' must be a boolean or a schema",
            ));
        } else if additional.is_object() {
            check_schema_node(additional, &child_path(path, "additionalProperties"), violations);
        }
    }
}

/// Insert defaults for missing object keys, recursing into present values.
fn apply_defaults(schema: &Value, doc: &mut Value) {
    let Some(schema_obj) = schema.as_object() else {
        return;
    };
    let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) else {
        if let (Some(items), Value::Array(entries)) = (schema_obj.get("items"), &mut *doc) {
            for entry in entries {
                apply_defaults(items, entry);
            }
        }
        return;
    };
    let Value::Object(doc_map) = doc else {
        return;
    };

    for (name, prop_schema) in properties {
        match doc_map.get_mut(name) {
            Some(existing) => apply_defaults(prop_schema, existing),
            None => {
                if let Some(default) = prop_schema.get("default") {
                    let mut value = default.clone();
                    apply_defaults(prop_schema, &mut value);
                    doc_map.insert(name.clone(), value);
                }
            }
        }
    }
}

fn validate_value(schema: &Value, doc: &Value, path: &str, violations: &mut Vec<SchemaViolation>) {
    let Some(schema_obj) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema_obj.get("type").and_then(Value::as_str) {
        if !type_matches(expected, doc) {
            violations.push(SchemaViolation::new(
                path,
                format!("expected {expected}, got {}", type_name(doc)),
            ));
            return;
        }
    }

    if let Some(choices) = schema_obj.get("enum").and_then(Value::as_array) {
        if !choices.contains(doc) {
            violations.push(SchemaViolation::new(
                path,
                format!("value {doc} is not one of the allowed values"),
            ));
        }
    }

    if let Some(number) = doc.as_f64() {
        if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64) {
            if number < min {
                violations.push(SchemaViolation::new(path, format!("{number} is less than minimum {min}")));
            }
        }
        if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64) {
            if number > max {
                violations.push(SchemaViolation::new(
                    path,
                    format!("{number} is greater than maximum {max}"),
                ));
            }
        }
    }

    if let Some(text) = doc.as_str() {
        let length = text.chars().count() as u64;
        if let Some(min) = schema_obj.get("minLength").and_then(Value::as_u64) {
            if length < min {
                violations.push(SchemaViolation::new(
                    path,
                    format!("string is shorter than minLength {min}"),
                ));
            }
        }
        if let Some(max) = schema_obj.get("maxLength").and_then(Value::as_u64) {
            if length > max {
                violations.push(SchemaViolation::new(
                    path,
                    format!("string is longer than maxLength {max}"),
                ));
            }
        }
        if let Some(pattern) = schema_obj.get("pattern").and_then(Value::as_str) {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(text) {
                        violations.push(SchemaViolation::new(
                            path,
                            format!("string does not match pattern {pattern}"),
                        ));
                    }
                }
                Err(_) => violations.push(SchemaViolation::new(
                    path,
                    format!("schema pattern is not a valid regex: {pattern}"),
                )),
            }
        }
    }

    if let Value::Object(doc_map) = doc {
        validate_object(schema_obj, doc_map, path, violations);
    }

    if let (Some(items), Value::Array(entries)) = (schema_obj.get("items"), doc) {
        for (i, entry) in entries.iter().enumerate() {
            validate_value(items, entry, &child_path(path, &i.to_string()), violations);
        }
    }
}

fn validate_object(
    schema_obj: &Map<String, Value>,
    doc_map: &Map<String, Value>,
    path: &str,
    violations: &mut Vec<SchemaViolation>,
) {
    let properties = schema_obj.get("properties").and_then(Value::as_object);

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !doc_map.contains_key(name) {
                violations.push(SchemaViolation::new(
                    child_path(path, name),
                    "missing required property",
                ));
            }
        }
    }

    if let Some(props) = properties {
        for (name, prop_schema) in props {
            if let Some(value) = doc_map.get(name) {
                validate_value(prop_schema, value, &child_path(path, name), violations);
            }
        }
    }

    match schema_obj.get("additionalProperties") {
        Some(Value::Bool(false)) => {
            for name in doc_map.keys() {
                if properties.is_none_or(|p| !p.contains_key(name)) {
                    violations.push(SchemaViolation::new(
                        child_path(path, name),
                        "additional properties are not allowed",
                    ));
                }
            }
        }
        Some(additional @ Value::Object(_)) => {
            for (name, value) in doc_map {
                if properties.is_none_or(|p| !p.contains_key(name)) {
                    validate_value(additional, value, &child_path(path, name), violations);
                }
            }
        }
        _ => {}
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn child_path(parent: &str, segment: &str) -> String {
    if parent == "(root)" {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}
