//! Attribute values of the running instance.
use std::sync::RwLock;

use crate::{
    emitter::{EmitType, Emitter, EventDetails},
    evaluator::Evaluator,
    persister::{self, StorageNamespace},
    value::{inputs, Value},
};

pub struct AttributesManager {
    emitter: Emitter,
    attributes: RwLock<serde_json::Map<String, Value>>,
}

impl AttributesManager {
    pub fn new(emitter: Emitter) -> AttributesManager {
        AttributesManager {
            emitter,
            attributes: RwLock::new(serde_json::Map::new()),
        }
    }

    /// Load persisted values of all attributes. Replaces whatever was set before.
    pub fn initialize(&self, evaluator: Evaluator<'_>) {
        let reader = evaluator.reader();
        let persisted = persister::initialize_from_storage(
            evaluator,
            StorageNamespace::Attributes,
            reader.get_attribute_names().into_iter().filter_map(|name| {
                let attribute = reader.get_attribute(name)?;
                Some((name, attribute.persist.as_ref()))
            }),
        );
        log::debug!(target: "eventvisor", count = persisted.len(); "attributes initialized");

        if let Ok(mut attributes) = self.attributes.write() {
            *attributes = persisted;
        }
    }

    /// Validate, transform, store and persist an attribute value.
    ///
    /// Returns the stored value, or `None` if the attribute is unknown or the value is invalid.
    pub fn set_attribute(
        &self,
        evaluator: Evaluator<'_>,
        attribute_name: &str,
        value: Value,
    ) -> Option<Value> {
        let Some(attribute) = evaluator.reader().get_attribute(attribute_name) else {
            log::error!(target: "eventvisor", attribute_name; "attribute not found in datafile");
            return None;
        };

        if attribute.deprecated == Some(true) {
            log::warn!(target: "eventvisor", attribute_name; "attribute is deprecated");
        }

        let validation = evaluator.validator().validate(&attribute.schema, Some(&value));
        if !validation.valid {
            log::warn!(target: "eventvisor",
                       attribute_name,
                       errors:serde = validation.errors;
                       "attribute validation failed");
            return None;
        }
        let validated = validation.value.unwrap_or(Value::Null);

        let transformed = match &attribute.transforms {
            Some(transforms) => {
                let inputs = inputs([
                    ("payload", Some(validated.clone())),
                    ("attributeName", Some(Value::from(attribute_name))),
                ]);
                evaluator
                    .transformer()
                    .apply_all(&validated, transforms, &inputs)
            }
            None => validated,
        };

        if let Ok(mut attributes) = self.attributes.write() {
            attributes.insert(attribute_name.to_owned(), transformed.clone());
        }
        log::debug!(target: "eventvisor", attribute_name; "attribute set");

        self.emitter
            .trigger(EmitType::AttributeSet, &attribute_details(attribute_name));

        persister::persist_entity(
            evaluator,
            StorageNamespace::Attributes,
            attribute_name,
            attribute.persist.as_ref(),
            &transformed,
        );

        Some(transformed)
    }

    /// Current value, `null` if the attribute is not set.
    pub fn get_attribute_value(&self, attribute_name: &str) -> Value {
        self.attributes
            .read()
            .ok()
            .and_then(|attributes| attributes.get(attribute_name).cloned())
            .unwrap_or(Value::Null)
    }

    pub fn is_attribute_set(&self, attribute_name: &str) -> bool {
        self.attributes
            .read()
            .is_ok_and(|attributes| attributes.contains_key(attribute_name))
    }

    /// Snapshot of all attribute values.
    pub fn get_attributes(&self) -> serde_json::Map<String, Value> {
        self.attributes
            .read()
            .map(|attributes| attributes.clone())
            .unwrap_or_default()
    }

    pub fn remove_attribute(&self, evaluator: Evaluator<'_>, attribute_name: &str) {
        let persist = evaluator
            .reader()
            .get_attribute(attribute_name)
            .and_then(|attribute| attribute.persist.as_ref());
        persister::remove_entity(evaluator, StorageNamespace::Attributes, attribute_name, persist);

        if let Ok(mut attributes) = self.attributes.write() {
            attributes.remove(attribute_name);
        }

        self.emitter
            .trigger(EmitType::AttributeRemoved, &attribute_details(attribute_name));
    }
}

fn attribute_details(attribute_name: &str) -> EventDetails {
    let mut details = EventDetails::new();
    details.insert("attributeName".to_owned(), Value::from(attribute_name));
    details
}
