//! Validation of payloads and attribute values against datafile schemas.
//!
//! Validation never fails: every problem is reported in [`ValidationResult::errors`]. A valid
//! result carries the value with schema defaults applied.
use serde::Serialize;

use crate::{
    datafile::{JsonSchema, SchemaItems, SchemaType},
    datafile_reader::DatafileReader,
    path::{Path, PathSegment},
    value::{js_type_of, values_equal, Value},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    /// Location of the offending value, e.g. `user.tags[2]`. Empty for the root.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
}

#[derive(Clone, Copy)]
pub struct Validator<'a> {
    reader: &'a DatafileReader,
}

impl<'a> Validator<'a> {
    pub fn new(reader: &'a DatafileReader) -> Validator<'a> {
        Validator { reader }
    }

    /// Validate `value` (`None` is "undefined") against `schema`.
    pub fn validate(&self, schema: &JsonSchema, value: Option<&Value>) -> ValidationResult {
        let mut errors = Vec::new();
        let result = self.validate_value(schema, value, &Path::default(), &mut errors);

        if result.is_none() && errors.is_empty() {
            if let Some(default) = &schema.default {
                return ValidationResult {
                    valid: true,
                    value: Some(default.clone()),
                    errors,
                };
            }
        }

        ValidationResult {
            valid: errors.is_empty(),
            value: result,
            errors,
        }
    }

    fn validate_value(
        &self,
        schema: &JsonSchema,
        value: Option<&Value>,
        path: &Path,
        errors: &mut Vec<ValidationError>,
    ) -> Option<Value> {
        let Some(value) = value else {
            if let Some(default) = &schema.default {
                return Some(default.clone());
            }
            if schema.schema_type.is_some() {
                return push(errors, path, "Required field missing".to_owned());
            }
            return None;
        };

        if value.is_null() {
            let null_enumerated = schema
                .enum_values
                .as_ref()
                .is_some_and(|values| values.iter().any(Value::is_null));
            match schema.schema_type {
                Some(SchemaType::Null) => return Some(Value::Null),
                _ if null_enumerated => return Some(Value::Null),
                Some(schema_type) => {
                    let message = format!("Expected type {}, got null", schema_type.as_str());
                    return push(errors, path, message);
                }
                None => {}
            }
        }

        // Integers are checked after the numeric constraints.
        if let Some(schema_type) = schema.schema_type {
            if schema_type != SchemaType::Integer && !type_matches(schema_type, value) {
                let message = format!(
                    "Expected type {}, got {}",
                    schema_type.as_str(),
                    js_type_of(Some(value))
                );
                return push(errors, path, message);
            }
        }

        if let Some(expected) = &schema.const_value {
            if !values_equal(value, expected) {
                let message = format!("Value must be exactly {}", to_json(expected));
                return push(errors, path, message);
            }
        }

        if let Some(values) = &schema.enum_values {
            if !values.iter().any(|v| values_equal(v, value)) {
                let options: Vec<_> = values.iter().map(to_json).collect();
                let message = format!("Value must be one of: {}", options.join(", "));
                return push(errors, path, message);
            }
        }

        let result = match value {
            Value::Object(object) => match &schema.properties {
                Some(properties) => {
                    Value::Object(self.validate_object(schema, properties, object, path, errors))
                }
                None => value.clone(),
            },
            Value::Array(items) => {
                let len = items.len();
                if let Some(min) = schema.min_items.filter(|min| len < *min) {
                    return push(errors, path, format!("Array must have at least {min} items, got {len}"));
                }
                if let Some(max) = schema.max_items.filter(|max| len > *max) {
                    return push(errors, path, format!("Array must have at most {max} items, got {len}"));
                }
                match &schema.items {
                    Some(items_schema) => {
                        Value::Array(self.validate_items(items_schema, items, path, errors))
                    }
                    None => value.clone(),
                }
            }
            Value::String(s) => {
                // Lengths are counted in UTF-16 code units.
                let len = s.encode_utf16().count();
                if let Some(min) = schema.min_length.filter(|min| len < *min) {
                    return push(errors, path, format!("String must be at least {min} characters long"));
                }
                if let Some(max) = schema.max_length.filter(|max| len > *max) {
                    return push(errors, path, format!("String must be at most {max} characters long"));
                }
                if let Some(pattern) = &schema.pattern {
                    let matched = match self.reader.get_regex(pattern, "") {
                        Ok(regex) => regex.is_match(s),
                        Err(err) => {
                            log::warn!(target: "eventvisor",
                                       pattern = pattern.as_str();
                                       "invalid schema pattern: {err}");
                            false
                        }
                    };
                    if !matched {
                        return push(errors, path, format!("String must match pattern: {pattern}"));
                    }
                }
                value.clone()
            }
            Value::Number(n) => {
                let n = n.as_f64().unwrap_or(f64::NAN);
                if let Some(minimum) = schema.minimum.filter(|minimum| n < *minimum) {
                    return push(errors, path, format!("Number must be at least {minimum}"));
                }
                if let Some(maximum) = schema.maximum.filter(|maximum| n > *maximum) {
                    return push(errors, path, format!("Number must be at most {maximum}"));
                }
                if schema.schema_type == Some(SchemaType::Integer) && n.fract() != 0.0 {
                    return push(errors, path, "Number must be an integer".to_owned());
                }
                value.clone()
            }
            Value::Bool(_) | Value::Null => value.clone(),
        };

        if schema.schema_type == Some(SchemaType::Integer) && !value.is_number() {
            return push(
                errors,
                path,
                format!("Expected type integer, got {}", js_type_of(Some(value))),
            );
        }

        Some(result)
    }

    fn validate_object(
        &self,
        schema: &JsonSchema,
        properties: &indexmap::IndexMap<String, JsonSchema>,
        object: &serde_json::Map<String, Value>,
        path: &Path,
        errors: &mut Vec<ValidationError>,
    ) -> serde_json::Map<String, Value> {
        let mut validated = serde_json::Map::new();

        for required in schema.required.iter().flatten() {
            if object.contains_key(required) {
                continue;
            }
            match properties.get(required).and_then(|p| p.default.as_ref()) {
                Some(default) => {
                    validated.insert(required.clone(), default.clone());
                }
                None => errors.push(ValidationError {
                    path: path.join(PathSegment::Field(required.clone())).to_string(),
                    message: format!("Required property '{required}' is missing"),
                }),
            }
        }

        for (key, property_value) in object {
            match properties.get(key) {
                Some(property_schema) => {
                    let property_path = path.join(PathSegment::Field(key.clone()));
                    if let Some(v) = self.validate_value(
                        property_schema,
                        Some(property_value),
                        &property_path,
                        errors,
                    ) {
                        validated.insert(key.clone(), v);
                    }
                }
                // Undeclared properties pass through.
                None => {
                    validated.insert(key.clone(), property_value.clone());
                }
            }
        }

        for (key, property_schema) in properties {
            if validated.contains_key(key) {
                continue;
            }
            if let Some(default) = &property_schema.default {
                validated.insert(key.clone(), default.clone());
            }
        }

        validated
    }

    fn validate_items(
        &self,
        items_schema: &SchemaItems,
        items: &[Value],
        path: &Path,
        errors: &mut Vec<ValidationError>,
    ) -> Vec<Value> {
        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let item_schema = match items_schema {
                    SchemaItems::Single(schema) => schema.as_ref(),
                    SchemaItems::Tuple(schemas) => match schemas.get(i) {
                        Some(schema) => schema,
                        None => return Some(item.clone()),
                    },
                };
                self.validate_value(item_schema, Some(item), &path.join(PathSegment::Index(i)), errors)
            })
            .collect()
    }
}

fn push(errors: &mut Vec<ValidationError>, path: &Path, message: String) -> Option<Value> {
    errors.push(ValidationError {
        path: path.to_string(),
        message,
    });
    None
}

fn type_matches(schema_type: SchemaType, value: &Value) -> bool {
    match schema_type {
        SchemaType::String => value.is_string(),
        SchemaType::Number => value.is_number(),
        SchemaType::Integer => value
            .as_f64()
            .is_some_and(|n| n.fract() == 0.0),
        SchemaType::Boolean => value.is_boolean(),
        SchemaType::Null => value.is_null(),
        SchemaType::Object => value.is_object(),
        SchemaType::Array => value.is_array(),
        SchemaType::Unknown => true,
    }
}

fn to_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Lift an error into a plain record so it can be validated and tracked like any other payload.
///
/// The record has `name`, `message` and `stack` (the chain of underlying causes, one per line)
/// plus the properties of `extra` when it is an object.
pub fn error_to_value(error: &dyn std::error::Error, extra: Option<&Value>) -> Value {
    let mut stack = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        stack.push(format!("caused by: {cause}"));
        source = cause.source();
    }

    let mut record = serde_json::Map::new();
    record.insert("name".to_owned(), Value::from("Error"));
    record.insert("message".to_owned(), Value::from(error.to_string()));
    record.insert("stack".to_owned(), Value::from(stack.join("\n")));
    if let Some(Value::Object(extra)) = extra {
        record.extend(extra.clone());
    }
    Value::Object(record)
}
