//! Stateful side effects reacting to tracked events and attribute changes.
use std::sync::RwLock;

use crate::{
    datafile::EffectOnType,
    evaluator::Evaluator,
    persister::{self, StorageNamespace},
    value::{inputs, Value},
};

/// Current state of every effect.
pub struct EffectsManager {
    states: RwLock<serde_json::Map<String, Value>>,
}

impl Default for EffectsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectsManager {
    pub fn new() -> EffectsManager {
        EffectsManager {
            states: RwLock::new(serde_json::Map::new()),
        }
    }

    /// Fill in the state of effects that don't have one yet: the persisted state if there is one,
    /// otherwise the initial state declared in the datafile.
    ///
    /// Effects that already have a state keep it, so this can run again after a datafile change.
    pub fn initialize(&self, evaluator: Evaluator<'_>) {
        let reader = evaluator.reader();
        let effect_names = reader.get_effect_names();
        let persisted = persister::initialize_from_storage(
            evaluator,
            StorageNamespace::Effects,
            effect_names.iter().filter_map(|name| {
                let effect = reader.get_effect(name)?;
                Some((*name, effect.persist.as_ref()))
            }),
        );

        let Ok(mut states) = self.states.write() else {
            return;
        };
        for effect_name in effect_names {
            if states.contains_key(effect_name) {
                continue;
            }
            let Some(effect) = reader.get_effect(effect_name) else {
                continue;
            };
            let state = persisted.get(effect_name).or(effect.state.as_ref());
            if let Some(state) = state {
                states.insert(effect_name.to_owned(), state.clone());
            }
        }
    }

    /// Pick up effects introduced by a new datafile.
    pub fn refresh(&self, evaluator: Evaluator<'_>) {
        self.initialize(evaluator);
    }

    /// Run every effect triggered by `on_type`/`name`.
    ///
    /// `value` is the validated (and transformed) event payload or attribute value.
    pub fn dispatch(&self, evaluator: Evaluator<'_>, on_type: EffectOnType, name: &str, value: &Value) {
        let reader = evaluator.reader();
        let checker = evaluator.conditions_checker();
        let name_key = match on_type {
            EffectOnType::EventTracked => "eventName",
            EffectOnType::AttributeSet => "attributeName",
        };

        for effect_name in reader.get_effect_names() {
            let Some(effect) = reader.get_effect(effect_name) else {
                continue;
            };
            let Some(on) = &effect.on else {
                continue;
            };
            if !on.matches(on_type, name) {
                continue;
            }

            let mut state = self.get_state_value(effect_name);
            let step_inputs = |state: &Option<Value>| {
                inputs([
                    ("payload", Some(value.clone())),
                    (name_key, Some(Value::from(name))),
                    ("state", state.clone()),
                ])
            };

            if let Some(conditions) = &effect.conditions {
                if !checker.all_are_matched(conditions, &step_inputs(&state)) {
                    log::debug!(target: "eventvisor", effect_name, name; "effect conditions not matched");
                    continue;
                }
            }

            for step in &effect.steps {
                if let Some(conditions) = &step.conditions {
                    if !checker.all_are_matched(conditions, &step_inputs(&state)) {
                        continue;
                    }
                }

                if let Some(handler) = &step.handler {
                    let handled = evaluator
                        .modules()
                        .handle(handler, effect_name, effect, step, value);
                    if handled.is_err() && step.continue_on_error == Some(false) {
                        log::debug!(target: "eventvisor", effect_name; "effect step failed, stopping");
                        break;
                    }
                }

                if let Some(transforms) = &step.transforms {
                    let transform_inputs = inputs([
                        (name_key, Some(Value::from(name))),
                        ("state", state.clone()),
                    ]);
                    let current = state.take().unwrap_or(Value::Null);
                    state = Some(evaluator.transformer().apply_all(
                        &current,
                        transforms,
                        &transform_inputs,
                    ));
                }
            }

            let Some(state) = state else {
                continue;
            };
            if let Ok(mut states) = self.states.write() {
                states.insert(effect_name.to_owned(), state.clone());
            }
            log::trace!(target: "eventvisor", effect_name, state:serde; "effect state updated");
            persister::persist_entity(
                evaluator,
                StorageNamespace::Effects,
                effect_name,
                effect.persist.as_ref(),
                &state,
            );
        }
    }

    /// Current state of an effect. `None` if the effect has no state.
    pub fn get_state_value(&self, effect_name: &str) -> Option<Value> {
        self.states.read().ok()?.get(effect_name).cloned()
    }

    pub fn get_all_states(&self) -> serde_json::Map<String, Value> {
        self.states
            .read()
            .map(|states| states.clone())
            .unwrap_or_default()
    }
}
