//! Ordered, non-destructive value transforms.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    conditions::{Condition, ConditionsChecker},
    datafile::{deserialize_present, OneOrMany},
    path::Path,
    source::{SourceDescriptor, SourceFields, SourceResolver},
    value::{number_value, parse_js_float, parse_js_int, to_js_number, to_js_string, Inputs, Value},
};

const DEFAULT_CONCAT_SEPARATOR: &str = " ";

const TRUTHY_STRINGS: [&str; 6] = ["true", "1", "checked", "yes", "on", "y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransformType {
    Set,
    Remove,
    Rename,
    Trim,
    Concat,
    ToInteger,
    ToDouble,
    ToString,
    ToBoolean,
    Increment,
    Decrement,
    Spread,
    Append,

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawTransform", into = "RawTransform")]
pub struct Transform {
    pub source: Option<SourceDescriptor>,
    pub transform_type: TransformType,
    pub target: Option<String>,
    /// `{"old.path": "new.path"}` pairs for `rename`.
    pub target_map: Option<OneOrMany<IndexMap<String, String>>>,
    /// Literal operand. `Some(Value::Null)` is an explicit `null`.
    pub value: Option<Value>,
    pub separator: Option<String>,
    pub conditions: Option<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransform {
    #[serde(flatten)]
    source: SourceFields,
    #[serde(rename = "type")]
    transform_type: TransformType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_map: Option<OneOrMany<IndexMap<String, String>>>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conditions: Option<Condition>,
}

impl From<RawTransform> for Transform {
    fn from(raw: RawTransform) -> Self {
        Transform {
            source: raw.source.into_descriptor(),
            transform_type: raw.transform_type,
            target: raw.target,
            target_map: raw.target_map,
            value: raw.value,
            separator: raw.separator,
            conditions: raw.conditions,
        }
    }
}

impl From<Transform> for RawTransform {
    fn from(transform: Transform) -> Self {
        RawTransform {
            source: SourceFields::from_descriptor(transform.source),
            transform_type: transform.transform_type,
            target: transform.target,
            target_map: transform.target_map,
            value: transform.value,
            separator: transform.separator,
            conditions: transform.conditions,
        }
    }
}

#[derive(Clone, Copy)]
pub struct Transformer<'a> {
    checker: ConditionsChecker<'a>,
    resolver: SourceResolver<'a>,
}

impl<'a> Transformer<'a> {
    pub fn new(checker: ConditionsChecker<'a>, resolver: SourceResolver<'a>) -> Transformer<'a> {
        Transformer { checker, resolver }
    }

    /// Apply `transforms` in order to a copy of `value`. The input itself is never modified.
    pub fn apply_all(&self, value: &Value, transforms: &[Transform], inputs: &Inputs) -> Value {
        transforms.iter().fold(value.clone(), |result, transform| {
            let matched = transform
                .conditions
                .as_ref()
                .map_or(true, |conditions| self.checker.all_are_matched(conditions, inputs));
            if matched {
                self.apply(result, transform, inputs)
            } else {
                result
            }
        })
    }

    fn apply(&self, mut result: Value, transform: &Transform, inputs: &Inputs) -> Value {
        use TransformType as T;

        let resolved = transform
            .source
            .as_ref()
            .and_then(|source| self.resolver.resolve(source, inputs));
        let target = transform.target.as_deref().map(Path::parse);

        // Without a usable source, a transform with a target reads its own target: from the
        // `payload` input when there is one, otherwise from the value being transformed.
        let source_value = match &target {
            Some(target) if resolved.as_ref().map_or(true, Value::is_null) => {
                let base = inputs.get("payload").unwrap_or(&result);
                target.get(base).cloned()
            }
            _ => resolved.clone(),
        };

        match (&target, transform.transform_type) {
            (Some(target), T::Trim) => {
                if let Some(Value::String(s)) = &source_value {
                    target.set(&mut result, Value::String(s.trim().to_owned()));
                }
            }
            (Some(target), T::Concat) => {
                if let Some(Value::Array(items)) = &source_value {
                    let separator = transform
                        .separator
                        .as_deref()
                        .filter(|s| !s.is_empty())
                        .unwrap_or(DEFAULT_CONCAT_SEPARATOR);
                    target.set(&mut result, Value::String(join(items, separator)));
                }
            }
            (Some(target), T::Set) => match transform.value.clone().or(source_value) {
                Some(value) => target.set(&mut result, value),
                None => target.remove(&mut result),
            },
            (Some(target), T::Remove) => target.remove(&mut result),
            (Some(target), T::ToInteger) => {
                let n = parse_js_int(&string_of(source_value.as_ref()));
                target.set(&mut result, number_value(n));
            }
            (Some(target), T::ToDouble) => {
                let n = parse_js_float(&string_of(source_value.as_ref()));
                target.set(&mut result, number_value(n));
            }
            (Some(target), T::ToString) => {
                target.set(&mut result, Value::String(string_of(source_value.as_ref())));
            }
            (Some(target), T::ToBoolean) => {
                let lowercased = string_of(source_value.as_ref()).to_lowercase();
                let truthy = TRUTHY_STRINGS.contains(&lowercased.as_str())
                    || source_value == Some(Value::Bool(true));
                target.set(&mut result, Value::Bool(truthy));
            }
            (None, T::Set) => {
                if let Some(value) = transform.value.clone().or(source_value) {
                    result = value;
                }
            }
            (target, T::Spread) => {
                let current = match target {
                    Some(target) => target.get(&result).cloned(),
                    None => Some(result.clone()),
                };
                let mut merged = object_or_empty(current);
                merged.extend(object_or_empty(source_value));
                match target {
                    Some(target) => target.set(&mut result, Value::Object(merged)),
                    None => result = Value::Object(merged),
                }
            }
            (target, T::Increment | T::Decrement) => {
                let by = match &transform.value {
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(1.0),
                    _ => 1.0,
                };
                let by = if transform.transform_type == T::Decrement {
                    -by
                } else {
                    by
                };
                match target {
                    Some(target) => {
                        let n = to_js_number(source_value.as_ref()) + by;
                        target.set(&mut result, number_value(n));
                    }
                    None => result = number_value(to_js_number(Some(&result)) + by),
                }
            }
            (target, T::Append) => {
                let Some(item) = transform.value.clone().or(resolved) else {
                    return result;
                };
                match target {
                    Some(target) => {
                        let appended = match target.get(&result) {
                            None | Some(Value::Null) => Some(vec![item]),
                            Some(Value::Array(items)) => {
                                let mut items = items.clone();
                                items.push(item);
                                Some(items)
                            }
                            Some(_) => None,
                        };
                        if let Some(items) = appended {
                            target.set(&mut result, Value::Array(items));
                        }
                    }
                    None => {
                        if result.is_null() {
                            result = Value::Array(Vec::new());
                        }
                        if let Value::Array(items) = &mut result {
                            items.push(item);
                        }
                    }
                }
            }
            (_, T::Rename) => {
                if let Some(target_map) = &transform.target_map {
                    for (from, to) in target_map.as_slice().iter().flatten() {
                        rename(&mut result, from, to);
                    }
                }
            }
            (_, T::Unknown) => {
                log::warn!(target: "eventvisor",
                           transform:serde;
                           "unknown transform type, skipping");
            }
            (None, _) => {
                log::debug!(target: "eventvisor",
                            transform_type:serde = transform.transform_type;
                            "transform requires a target, skipping");
            }
        }

        result
    }
}

/// Move the value at `from` to `to`. Nothing happens when `from` does not exist.
fn rename(value: &mut Value, from: &str, to: &str) {
    if !matches!(value, Value::Object(_) | Value::Array(_)) || from.is_empty() || to.is_empty() {
        return;
    }
    let from = Path::parse(from);
    let Some(old) = from.get(value).cloned() else {
        return;
    };
    from.remove(value);
    Path::parse(to).set(value, old);
}

/// `String(value)`, where `None` is `undefined`.
fn string_of(value: Option<&Value>) -> String {
    value.map_or_else(|| "undefined".to_owned(), to_js_string)
}

/// `Array.prototype.join`: `null` items become empty strings.
fn join(items: &[Value], separator: &str) -> String {
    items
        .iter()
        .map(|item| match item {
            Value::Null => String::new(),
            item => to_js_string(item),
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn object_or_empty(value: Option<Value>) -> serde_json::Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}
