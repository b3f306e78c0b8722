//! Datafile models.
//!
//! Field names follow the JSON datafile (`camelCase`). Maps of entities keep their declaration
//! order, which is the order effects and destinations are processed in.
use derive_more::From;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    bucketer::Sample, conditions::Condition, transformer::Transform, value::Value, Error, Result,
};

/// Complete datafile: one immutable revision of the engine's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Datafile {
    pub schema_version: String,
    pub revision: String,
    /// Each entity is wrapped in `TryParse` so that one malformed entity (e.g., produced by a
    /// newer datafile builder) does not make the whole datafile unusable.
    pub attributes: IndexMap<String, TryParse<Attribute>>,
    pub events: IndexMap<String, TryParse<Event>>,
    pub destinations: IndexMap<String, TryParse<Destination>>,
    pub effects: IndexMap<String, TryParse<Effect>>,
}

impl Default for Datafile {
    fn default() -> Self {
        Datafile {
            schema_version: "1".to_owned(),
            revision: "0".to_owned(),
            attributes: IndexMap::new(),
            events: IndexMap::new(),
            destinations: IndexMap::new(),
            effects: IndexMap::new(),
        }
    }
}

impl Datafile {
    /// Datafile without any entities (`schemaVersion: "1"`, `revision: "0"`).
    pub fn empty() -> Datafile {
        Datafile::default()
    }

    /// Parse a datafile from its JSON representation.
    ///
    /// ```
    /// # use eventvisor::Datafile;
    /// let datafile = Datafile::from_json_str(r#"{"schemaVersion": "1", "revision": "7"}"#).unwrap();
    /// assert_eq!(datafile.revision, "7");
    /// ```
    pub fn from_json_str(s: &str) -> Result<Datafile> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_value(value: Value) -> Result<Datafile> {
        serde_json::from_value(value).map_err(Error::from)
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Either a single item or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => std::slice::from_ref(item),
        }
    }
}

/// Deserialize a field that must distinguish "absent" (`None`, via `#[serde(default)]`) from an
/// explicit `null` (`Some(Value::Null)`).
pub(crate) fn deserialize_present<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

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
    /// Type names this version does not know about. Values are accepted as is.
    #[serde(other)]
    Unknown,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Null => "null",
            SchemaType::Unknown => "unknown",
        }
    }
}

/// JSON-Schema-like type definition shared by attributes, events and nested properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(
        rename = "const",
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub const_value: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<SchemaItems>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_items: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<IndexMap<String, JsonSchema>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub examples: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum SchemaItems {
    /// Positional schemas, one per array element.
    Tuple(Vec<JsonSchema>),
    Single(Box<JsonSchema>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    #[serde(flatten)]
    pub schema: JsonSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Vec<Transform>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist: Option<Persist>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Fatal,
    Error,
    Warning,
    Log,
    #[default]
    Info,
    Debug,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Fatal => "fatal",
            EventLevel::Error => "error",
            EventLevel::Warning => "warning",
            EventLevel::Log => "log",
            EventLevel::Info => "info",
            EventLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub schema: JsonSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<EventLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_attributes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<OneOrMany<Sample>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Vec<Transform>>,
    /// Per-destination overrides, keyed by destination name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<IndexMap<String, DestinationOverride>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum DestinationOverride {
    /// `false` disables the destination for this event. `true` is a no-op.
    Enabled(bool),
    Options(DestinationOverrideOptions),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationOverrideOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<OneOrMany<Sample>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Vec<Transform>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Module address: `"<moduleName>[.<key>]"`.
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<OneOrMany<Sample>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Vec<Transform>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectOnType {
    EventTracked,
    AttributeSet,
}

impl EffectOnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectOnType::EventTracked => "event_tracked",
            EffectOnType::AttributeSet => "attribute_set",
        }
    }
}

/// Triggers of an effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EffectOn {
    /// `["event_tracked"]`: any event (or attribute) of the listed kinds.
    Types(Vec<EffectOnType>),
    /// `{"event_tracked": ["page_view"]}`: only the named events (or attributes).
    Names {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_tracked: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute_set: Option<Vec<String>>,
    },
}

impl EffectOn {
    pub fn matches(&self, on_type: EffectOnType, name: &str) -> bool {
        match self {
            EffectOn::Types(types) => types.contains(&on_type),
            EffectOn::Names {
                event_tracked,
                attribute_set,
            } => {
                let names = match on_type {
                    EffectOnType::EventTracked => event_tracked,
                    EffectOnType::AttributeSet => attribute_set,
                };
                names
                    .as_ref()
                    .is_some_and(|names| names.iter().any(|n| n == name))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Effect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<EffectOn>,
    /// Initial state.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist: Option<Persist>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Module address of the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Vec<Transform>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
}

/// Storage binding of an attribute or effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Persist {
    /// Name of a storage module.
    Storage(String),
    Complex(ComplexPersist),
    Multiple(Vec<Persist>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexPersist {
    pub storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
}

impl Persist {
    /// Flatten into an ordered list of candidate bindings.
    pub fn to_complex(&self) -> Vec<ComplexPersist> {
        match self {
            Persist::Storage(storage) => vec![ComplexPersist {
                storage: storage.clone(),
                conditions: None,
            }],
            Persist::Complex(persist) => vec![persist.clone()],
            Persist::Multiple(persists) => persists.iter().flat_map(Persist::to_complex).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use serde_json::json;

    use super::*;

    #[test]
    fn parse_datafile_fixture() {
        let f = File::open("tests/data/datafile.json")
            .expect("Failed to open tests/data/datafile.json");
        let datafile: Datafile = serde_json::from_reader(BufReader::new(f)).unwrap();

        assert_eq!(datafile.revision, "12");
        assert!(datafile
            .attributes
            .values()
            .all(|attribute| matches!(attribute, TryParse::Parsed(_))));
        assert!(datafile
            .events
            .values()
            .all(|event| matches!(event, TryParse::Parsed(_))));
        assert!(datafile
            .effects
            .values()
            .all(|effect| matches!(effect, TryParse::Parsed(_))));
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let datafile = Datafile::from_value(json!({
            "schemaVersion": "1",
            "revision": "1",
            "destinations": {
                "ok": {"transport": "console"},
                "fail_parsing": {"transport": 42}
            }
        }))
        .unwrap();

        assert!(matches!(
            datafile.destinations.get("ok").unwrap(),
            TryParse::Parsed(_)
        ));
        assert!(matches!(
            datafile.destinations.get("fail_parsing").unwrap(),
            TryParse::ParseFailed(_)
        ));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let datafile = Datafile::from_json_str("{}").unwrap();
        assert_eq!(datafile.schema_version, "1");
        assert_eq!(datafile.revision, "0");
        assert!(datafile.events.is_empty());
    }

    #[test]
    fn explicit_null_is_kept_apart_from_absent() {
        let effect: Effect = serde_json::from_value(json!({"state": null})).unwrap();
        assert_eq!(effect.state, Some(Value::Null));

        let effect: Effect = serde_json::from_value(json!({})).unwrap();
        assert_eq!(effect.state, None);

        let schema: JsonSchema =
            serde_json::from_value(json!({"type": "null", "default": null})).unwrap();
        assert_eq!(schema.default, Some(Value::Null));
    }

    #[test]
    fn persist_flattens_in_order() {
        let persist: Persist = serde_json::from_value(json!([
            "first",
            {"storage": "second", "conditions": "*"},
            ["third", "fourth"]
        ]))
        .unwrap();

        let storages: Vec<_> = persist
            .to_complex()
            .into_iter()
            .map(|persist| persist.storage)
            .collect();
        assert_eq!(storages, ["first", "second", "third", "fourth"]);
    }

    #[test]
    fn effect_on_forms() {
        let on: EffectOn = serde_json::from_value(json!(["event_tracked"])).unwrap();
        assert!(on.matches(EffectOnType::EventTracked, "anything"));
        assert!(!on.matches(EffectOnType::AttributeSet, "anything"));

        let on: EffectOn =
            serde_json::from_value(json!({"event_tracked": ["page_view"]})).unwrap();
        assert!(on.matches(EffectOnType::EventTracked, "page_view"));
        assert!(!on.matches(EffectOnType::EventTracked, "click"));
        assert!(!on.matches(EffectOnType::AttributeSet, "page_view"));
    }

    #[test]
    fn unknown_schema_type_is_tolerated() {
        let schema: JsonSchema = serde_json::from_value(json!({"type": "date"})).unwrap();
        assert_eq!(schema.schema_type, Some(SchemaType::Unknown));
    }

    #[test]
    fn destination_override_forms() {
        let overrides: IndexMap<String, DestinationOverride> = serde_json::from_value(json!({
            "disabled": false,
            "enabled": true,
            "scoped": {"transforms": [{"type": "remove", "target": "referrer"}]}
        }))
        .unwrap();

        assert!(matches!(overrides["disabled"], DestinationOverride::Enabled(false)));
        assert!(matches!(overrides["enabled"], DestinationOverride::Enabled(true)));
        let DestinationOverride::Options(options) = &overrides["scoped"] else {
            panic!("expected options, got {:?}", overrides["scoped"]);
        };
        assert_eq!(options.transforms.as_ref().map(Vec::len), Some(1));

        assert!(matches!(
            DestinationOverride::from(false),
            DestinationOverride::Enabled(false)
        ));
        assert!(matches!(
            DestinationOverride::from(DestinationOverrideOptions::default()),
            DestinationOverride::Options(_)
        ));
    }
}
