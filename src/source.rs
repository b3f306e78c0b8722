//! Source descriptors and their resolution.
//!
//! A source descriptor points at a value that is only known at evaluation time: an attribute, an
//! effect's state, a field of the current payload, a module lookup or any other named input.
//! Conditions, transforms and sampling all resolve their sources through [`SourceResolver`].

use serde::{Deserialize, Serialize};

use crate::{
    attributes::AttributesManager,
    datafile::OneOrMany,
    effects::EffectsManager,
    modules::ModulesManager,
    path::Path,
    value::{Inputs, Value},
};

const SOURCE_PATH_SEPARATOR: char = '.';

/// Where a source value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Attribute,
    Attributes,
    Effect,
    Effects,
    State,
    Payload,
    Lookup,
    /// Any other named input, e.g. `eventName`.
    Input(String),
}

impl Origin {
    fn from_name(name: &str) -> Origin {
        match name {
            "attribute" => Origin::Attribute,
            "attributes" => Origin::Attributes,
            "effect" => Origin::Effect,
            "effects" => Origin::Effects,
            "state" => Origin::State,
            "payload" => Origin::Payload,
            "lookup" => Origin::Lookup,
            other => Origin::Input(other.to_owned()),
        }
    }

    fn input_key(&self) -> &str {
        match self {
            Origin::Attribute => "attribute",
            Origin::Attributes => "attributes",
            Origin::Effect => "effect",
            Origin::Effects => "effects",
            Origin::State => "state",
            Origin::Payload => "payload",
            Origin::Lookup => "lookup",
            Origin::Input(key) => key,
        }
    }
}

/// Declarative pointer to a value.
///
/// In a datafile it is written either as a dotted string whose first segment is the origin
/// (`"payload.user.id"`, also accepted as `{"source": "payload.user.id"}`) or as an object keyed by
/// the origin (`{"attribute": "userId"}`, `{"payload": ["firstName", "lastName"]}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSource", into = "RawSource")]
pub enum SourceDescriptor {
    Path(String),
    /// A list of keys resolves to a list of values.
    Keyed(Origin, OneOrMany<String>),
}

impl SourceDescriptor {
    pub fn attribute(key: impl Into<String>) -> SourceDescriptor {
        SourceDescriptor::Keyed(Origin::Attribute, OneOrMany::One(key.into()))
    }

    pub fn payload(key: impl Into<String>) -> SourceDescriptor {
        SourceDescriptor::Keyed(Origin::Payload, OneOrMany::One(key.into()))
    }
}

impl From<&str> for SourceDescriptor {
    fn from(value: &str) -> Self {
        SourceDescriptor::Path(value.to_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSource {
    Path(String),
    Fields(SourceFields),
}

impl TryFrom<RawSource> for SourceDescriptor {
    type Error = &'static str;

    fn try_from(value: RawSource) -> Result<Self, Self::Error> {
        match value {
            RawSource::Path(path) => Ok(SourceDescriptor::Path(path)),
            RawSource::Fields(fields) => fields.into_descriptor().ok_or("missing source field"),
        }
    }
}

impl From<SourceDescriptor> for RawSource {
    fn from(value: SourceDescriptor) -> Self {
        match value {
            SourceDescriptor::Path(path) => RawSource::Path(path),
            descriptor => RawSource::Fields(SourceFields::from_descriptor(Some(descriptor))),
        }
    }
}

/// Origin fields as they appear inline in conditions, transforms and samples.
///
/// Only one of them is expected. If several are present, the first one in declaration order wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SourceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attribute: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attributes: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    effect: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    effects: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lookup: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<OneOrMany<String>>,
}

impl SourceFields {
    pub(crate) fn into_descriptor(self) -> Option<SourceDescriptor> {
        if let Some(path) = self.source {
            return Some(SourceDescriptor::Path(path));
        }

        [
            (Origin::Attribute, self.attribute),
            (Origin::Attributes, self.attributes),
            (Origin::Effect, self.effect),
            (Origin::Effects, self.effects),
            (Origin::Payload, self.payload),
            (Origin::Lookup, self.lookup),
            (Origin::State, self.state),
        ]
        .into_iter()
        .find_map(|(origin, keys)| keys.map(|keys| SourceDescriptor::Keyed(origin, keys)))
    }

    pub(crate) fn from_descriptor(descriptor: Option<SourceDescriptor>) -> SourceFields {
        let mut fields = SourceFields::default();
        match descriptor {
            None => {}
            Some(SourceDescriptor::Path(path)) => fields.source = Some(path),
            Some(SourceDescriptor::Keyed(origin, keys)) => {
                let slot = match origin {
                    Origin::Attribute => &mut fields.attribute,
                    Origin::Attributes => &mut fields.attributes,
                    Origin::Effect => &mut fields.effect,
                    Origin::Effects => &mut fields.effects,
                    Origin::Payload => &mut fields.payload,
                    Origin::Lookup => &mut fields.lookup,
                    Origin::State => &mut fields.state,
                    Origin::Input(name) => {
                        // Generic inputs only exist in the dotted form.
                        let keys = keys.as_slice().join(".");
                        fields.source = Some(if keys.is_empty() {
                            name
                        } else {
                            format!("{name}.{keys}")
                        });
                        return fields;
                    }
                };
                *slot = Some(keys);
            }
        }
        fields
    }
}

/// A single resolvable location: origin, optional entity name and the path below it.
#[derive(Debug)]
struct SourceOrigin<'s> {
    origin: Origin,
    name: Option<&'s str>,
    path: Path,
    /// Everything after the origin. Lookups use it as the module address.
    address: &'s str,
}

impl<'s> SourceOrigin<'s> {
    fn from_path(path: &'s str) -> SourceOrigin<'s> {
        let (origin, rest) = path
            .split_once(SOURCE_PATH_SEPARATOR)
            .unwrap_or((path, ""));
        SourceOrigin::from_key(Origin::from_name(origin), rest)
    }

    fn from_key(origin: Origin, key: &'s str) -> SourceOrigin<'s> {
        let (name, rest) = key.split_once(SOURCE_PATH_SEPARATOR).unwrap_or((key, ""));
        SourceOrigin {
            origin,
            name: Some(name).filter(|name| !name.is_empty()),
            path: Path::parse(rest),
            address: key,
        }
    }
}

/// Resolves [`SourceDescriptor`]s against inputs and the instance's managers.
///
/// Resolution never fails: values that cannot be found are `None` ("undefined") or `null`.
#[derive(Clone, Copy)]
pub struct SourceResolver<'a> {
    modules: &'a ModulesManager,
    attributes: &'a AttributesManager,
    effects: &'a EffectsManager,
}

impl<'a> SourceResolver<'a> {
    pub fn new(
        modules: &'a ModulesManager,
        attributes: &'a AttributesManager,
        effects: &'a EffectsManager,
    ) -> SourceResolver<'a> {
        SourceResolver {
            modules,
            attributes,
            effects,
        }
    }

    /// Resolve a descriptor. A list of keys produces an array of values in the same order.
    pub fn resolve(&self, source: &SourceDescriptor, inputs: &Inputs) -> Option<Value> {
        match source {
            SourceDescriptor::Path(path) => {
                self.resolve_origin(&SourceOrigin::from_path(path), inputs)
            }
            SourceDescriptor::Keyed(origin, OneOrMany::One(key)) => {
                self.resolve_origin(&SourceOrigin::from_key(origin.clone(), key), inputs)
            }
            SourceDescriptor::Keyed(origin, OneOrMany::Many(keys)) => Some(Value::Array(
                keys.iter()
                    .map(|key| {
                        self.resolve_origin(&SourceOrigin::from_key(origin.clone(), key), inputs)
                            .unwrap_or(Value::Null)
                    })
                    .collect(),
            )),
        }
    }

    fn resolve_origin(&self, origin: &SourceOrigin, inputs: &Inputs) -> Option<Value> {
        match &origin.origin {
            Origin::Attribute | Origin::Attributes => {
                let value = match origin.name {
                    Some(name) => self.attributes.get_attribute_value(name),
                    None if origin.origin == Origin::Attributes => {
                        Value::Object(self.attributes.get_attributes())
                    }
                    None => Value::Null,
                };
                origin.path.get(&value).cloned()
            }
            Origin::Effect | Origin::Effects => {
                let value = match origin.name {
                    Some(name) => self.effects.get_state_value(name)?,
                    None if origin.origin == Origin::Effects => {
                        Value::Object(self.effects.get_all_states())
                    }
                    None => return None,
                };
                origin.path.get(&value).cloned()
            }
            Origin::Lookup => Some(self.modules.lookup(origin.address)),
            other => {
                let Some(input) = inputs.get(other.input_key()) else {
                    return Some(Value::Null);
                };
                Path::parse(origin.address).get(input).cloned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::{
        attributes::AttributesManager,
        datafile::{Datafile, OneOrMany},
        datafile_reader::DatafileReader,
        effects::EffectsManager,
        emitter::Emitter,
        evaluator::Evaluator,
        modules::{Module, ModulesManager},
        value::Inputs,
    };

    use super::{Origin, SourceDescriptor};

    fn inputs(value: serde_json::Value) -> Inputs {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("inputs must be an object"),
        }
    }

    #[test]
    fn parse_descriptor_forms() {
        let source: SourceDescriptor = serde_json::from_value(json!("payload.age")).unwrap();
        assert_eq!(source, SourceDescriptor::Path("payload.age".into()));

        let source: SourceDescriptor =
            serde_json::from_value(json!({"source": "payload.age"})).unwrap();
        assert_eq!(source, SourceDescriptor::Path("payload.age".into()));

        let source: SourceDescriptor = serde_json::from_value(json!({"attribute": "userId"})).unwrap();
        assert_eq!(source, SourceDescriptor::attribute("userId"));

        let source: SourceDescriptor =
            serde_json::from_value(json!({"payload": ["firstName", "lastName"]})).unwrap();
        assert_eq!(
            source,
            SourceDescriptor::Keyed(
                Origin::Payload,
                OneOrMany::Many(vec!["firstName".into(), "lastName".into()])
            )
        );

        assert!(serde_json::from_value::<SourceDescriptor>(json!({"unknown": "x"})).is_err());
    }

    #[test]
    fn serializes_back_to_datafile_form() {
        assert_eq!(
            serde_json::to_value(SourceDescriptor::attribute("userId")).unwrap(),
            json!({"attribute": "userId"})
        );
        assert_eq!(
            serde_json::to_value(SourceDescriptor::from("payload.age")).unwrap(),
            json!("payload.age")
        );
    }

    #[test]
    fn resolve_from_inputs() {
        let reader = DatafileReader::new(Datafile::empty());
        let modules = ModulesManager::new();
        let attributes = AttributesManager::new(Emitter::new());
        let effects = EffectsManager::new();
        let resolver = Evaluator::new(&reader, &modules, &attributes, &effects).source_resolver();

        let inputs = inputs(json!({
            "eventName": "page_view",
            "payload": {"user": {"id": 7, "tags": ["a", "b"]}},
        }));

        assert_eq!(
            resolver.resolve(&"payload.user.id".into(), &inputs),
            Some(json!(7))
        );
        assert_eq!(
            resolver.resolve(&"payload.user.tags.1".into(), &inputs),
            Some(json!("b"))
        );
        assert_eq!(
            resolver.resolve(&SourceDescriptor::payload("user.id"), &inputs),
            Some(json!(7))
        );
        assert_eq!(
            resolver.resolve(&"eventName".into(), &inputs),
            Some(json!("page_view"))
        );
        assert_eq!(
            resolver.resolve(&"payload".into(), &inputs),
            Some(json!({"user": {"id": 7, "tags": ["a", "b"]}}))
        );
        // missing intermediate segment
        assert_eq!(resolver.resolve(&"payload.account.id".into(), &inputs), None);
        // unknown input
        assert_eq!(
            resolver.resolve(&"somethingElse.id".into(), &inputs),
            Some(json!(null))
        );
    }

    #[test]
    fn multiple_keys_fan_out() {
        let reader = DatafileReader::new(Datafile::empty());
        let modules = ModulesManager::new();
        let attributes = AttributesManager::new(Emitter::new());
        let effects = EffectsManager::new();
        let resolver = Evaluator::new(&reader, &modules, &attributes, &effects).source_resolver();

        let source: SourceDescriptor =
            serde_json::from_value(json!({"payload": ["first", "missing", "last"]})).unwrap();
        assert_eq!(
            resolver.resolve(&source, &inputs(json!({"payload": {"first": "A", "last": "C"}}))),
            Some(json!(["A", null, "C"]))
        );
    }

    #[test]
    fn resolve_attributes_and_lookups() {
        let reader = DatafileReader::new(
            Datafile::from_value(json!({
                "attributes": {"userId": {"type": "string"}}
            }))
            .unwrap(),
        );
        let modules = ModulesManager::new();
        let keys = Arc::new(Mutex::new(Vec::new()));
        {
            let keys = keys.clone();
            modules.register_module(Module::new("env").with_lookup(move |options| {
                keys.lock().unwrap().push(options.key.to_owned());
                Ok(json!("production"))
            }));
        }
        let attributes = AttributesManager::new(Emitter::new());
        let effects = EffectsManager::new();
        let evaluator = Evaluator::new(&reader, &modules, &attributes, &effects);
        attributes.set_attribute(evaluator, "userId", json!("u1"));

        let resolver = evaluator.source_resolver();
        let empty = Inputs::new();

        assert_eq!(
            resolver.resolve(&SourceDescriptor::attribute("userId"), &empty),
            Some(json!("u1"))
        );
        assert_eq!(
            resolver.resolve(&"attributes".into(), &empty),
            Some(json!({"userId": "u1"}))
        );
        assert_eq!(
            resolver.resolve(&SourceDescriptor::attribute("country"), &empty),
            Some(json!(null))
        );

        let lookup: SourceDescriptor = serde_json::from_value(json!({"lookup": "env.stage"})).unwrap();
        assert_eq!(resolver.resolve(&lookup, &empty), Some(json!("production")));
        assert_eq!(
            resolver.resolve(&"lookup.env.stage".into(), &empty),
            Some(json!("production"))
        );
        assert_eq!(*keys.lock().unwrap(), ["stage", "stage"]);

        // no such module
        let lookup: SourceDescriptor =
            serde_json::from_value(json!({"lookup": "missing.key"})).unwrap();
        assert_eq!(resolver.resolve(&lookup, &empty), Some(json!(null)));
    }
}
