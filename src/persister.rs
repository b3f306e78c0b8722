//! Persistence of attribute values and effect states through storage modules.
use serde_json::json;

use crate::{
    conditions::ConditionsChecker,
    datafile::{ComplexPersist, Persist},
    evaluator::Evaluator,
    value::{inputs, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageNamespace {
    Attributes,
    Effects,
}

impl StorageNamespace {
    /// Storage key of an entity, e.g. `attributes_userId`.
    pub(crate) fn storage_key(self, entity_name: &str) -> String {
        let prefix = match self {
            StorageNamespace::Attributes => "attributes_",
            StorageNamespace::Effects => "effects_",
        };
        format!("{prefix}{entity_name}")
    }
}

/// First binding without conditions, or whose conditions match.
///
/// Conditions see the entity name as both `attributeName` and `effectName`, plus the payload.
pub(crate) fn find_persist<'p>(
    checker: ConditionsChecker<'_>,
    persists: &'p [ComplexPersist],
    entity_name: &str,
    payload: &Value,
) -> Option<&'p ComplexPersist> {
    let inputs = inputs([
        ("attributeName", Some(Value::from(entity_name))),
        ("effectName", Some(Value::from(entity_name))),
        ("payload", Some(payload.clone())),
    ]);
    persists.iter().find(|persist| {
        persist
            .conditions
            .as_ref()
            .map_or(true, |conditions| checker.all_are_matched(conditions, &inputs))
    })
}

fn bound_storage(
    evaluator: Evaluator<'_>,
    entity_name: &str,
    persist: Option<&Persist>,
    payload: &Value,
) -> Option<String> {
    let persists = evaluator.reader().get_persists(persist)?;
    find_persist(evaluator.conditions_checker(), &persists, entity_name, payload)
        .map(|persist| persist.storage.clone())
}

/// Read stored values of all entities that have a storage binding. Entities with nothing stored
/// are left out.
pub(crate) fn initialize_from_storage<'e>(
    evaluator: Evaluator<'_>,
    namespace: StorageNamespace,
    entities: impl IntoIterator<Item = (&'e str, Option<&'e Persist>)>,
) -> serde_json::Map<String, Value> {
    let empty = json!({});
    entities
        .into_iter()
        .filter_map(|(entity_name, persist)| {
            let storage = bound_storage(evaluator, entity_name, persist, &empty)?;
            let value = evaluator
                .modules()
                .read_from_storage(&storage, &namespace.storage_key(entity_name))?;
            Some((entity_name.to_owned(), value))
        })
        .collect()
}

pub(crate) fn persist_entity(
    evaluator: Evaluator<'_>,
    namespace: StorageNamespace,
    entity_name: &str,
    persist: Option<&Persist>,
    value: &Value,
) {
    let Some(storage) = bound_storage(evaluator, entity_name, persist, value) else {
        return;
    };
    log::trace!(target: "eventvisor", storage = storage.as_str(), entity_name; "persisting");
    evaluator
        .modules()
        .write_to_storage(&storage, &namespace.storage_key(entity_name), value);
}

pub(crate) fn remove_entity(
    evaluator: Evaluator<'_>,
    namespace: StorageNamespace,
    entity_name: &str,
    persist: Option<&Persist>,
) {
    let Some(storage) = bound_storage(evaluator, entity_name, persist, &json!({})) else {
        return;
    };
    evaluator
        .modules()
        .remove_from_storage(&storage, &namespace.storage_key(entity_name));
}
