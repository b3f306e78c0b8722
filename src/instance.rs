use std::{
    sync::{mpsc, Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    attributes::AttributesManager,
    datafile::{Datafile, Destination, DestinationOverride, EffectOnType, Event},
    datafile_store::DatafileStore,
    effects::EffectsManager,
    emitter::{EmitType, Emitter, EventDetails, Subscription},
    evaluator::Evaluator,
    modules::{Module, ModulesManager, TransportOptions},
    validator::error_to_value,
    value::{inputs, Inputs, Value},
    Error, InstanceConfig, Result,
};

/// Mutating operations, processed one at a time by the worker thread.
enum Action {
    Track {
        event_name: String,
        payload: Value,
        error: Option<String>,
        reply: mpsc::Sender<Option<Value>>,
    },
    SetAttribute {
        attribute_name: String,
        value: Value,
        reply: mpsc::Sender<Option<Value>>,
    },
    RemoveAttribute {
        attribute_name: String,
        reply: mpsc::Sender<()>,
    },
    RefreshEffects,
    Flush(mpsc::Sender<()>),
}

/// Outcome of a queued operation.
///
/// Dropping a `Pending` does not cancel the operation.
#[must_use = "call .wait() to get the outcome, or drop to run the operation in the background"]
pub struct Pending<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> Pending<T> {
    /// Block until the operation has completed.
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().map_err(|_| Error::WorkerThreadPanicked)
    }
}

/// State shared between the [`Instance`] handle and its worker thread.
struct Shared {
    store: DatafileStore,
    modules: ModulesManager,
    emitter: Emitter,
    attributes: AttributesManager,
    effects: EffectsManager,
    /// `true` once effects and attributes are initialized.
    ready: (Mutex<bool>, Condvar),
}

impl Shared {
    /// Run `f` against the current datafile revision.
    fn with_evaluator<T>(&self, f: impl FnOnce(Evaluator<'_>) -> T) -> T {
        let reader = self.store.get_reader();
        f(Evaluator::new(
            &reader,
            &self.modules,
            &self.attributes,
            &self.effects,
        ))
    }

    fn initialize(&self) {
        self.with_evaluator(|evaluator| {
            self.effects.initialize(evaluator);
            self.attributes.initialize(evaluator);
        });

        {
            let mut ready = match self.ready.0.lock() {
                Ok(ready) => ready,
                Err(poisoned) => poisoned.into_inner(),
            };
            *ready = true;
            self.ready.1.notify_all();
        }
        log::info!(target: "eventvisor", "instance is ready");
        self.emitter.trigger(EmitType::Ready, &EventDetails::new());
    }

    fn process(&self, action: Action) {
        match action {
            Action::Track {
                event_name,
                payload,
                error,
                reply,
            } => {
                let result = self.with_evaluator(|evaluator| {
                    self.track(evaluator, &event_name, payload, error.as_deref())
                });
                if result.is_some() {
                    let mut details = EventDetails::new();
                    details.insert("eventName".to_owned(), Value::from(event_name));
                    self.emitter.trigger(EmitType::EventTracked, &details);
                }
                let _ = reply.send(result);
            }
            Action::SetAttribute {
                attribute_name,
                value,
                reply,
            } => {
                let result = self.with_evaluator(|evaluator| {
                    let result = self.attributes.set_attribute(evaluator, &attribute_name, value);
                    if let Some(value) = &result {
                        self.effects.dispatch(
                            evaluator,
                            EffectOnType::AttributeSet,
                            &attribute_name,
                            value,
                        );
                    }
                    result
                });
                let _ = reply.send(result);
            }
            Action::RemoveAttribute {
                attribute_name,
                reply,
            } => {
                self.with_evaluator(|evaluator| {
                    self.attributes.remove_attribute(evaluator, &attribute_name);
                });
                let _ = reply.send(());
            }
            Action::RefreshEffects => {
                self.with_evaluator(|evaluator| self.effects.refresh(evaluator));
            }
            Action::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Validate, gate, transform and route one event. Returns the transformed payload, or `None`
    /// if the event was dropped.
    fn track(
        &self,
        evaluator: Evaluator<'_>,
        event_name: &str,
        payload: Value,
        error: Option<&str>,
    ) -> Option<Value> {
        let reader = evaluator.reader();
        let Some(event) = reader.get_event(event_name) else {
            log::error!(target: "eventvisor", event_name; "event not found in datafile");
            return None;
        };
        let event_level = event.level.unwrap_or_default();

        if event.deprecated == Some(true) {
            log::warn!(target: "eventvisor", event_name; "event is deprecated");
        }

        let validation = evaluator.validator().validate(&event.schema, Some(&payload));
        if !validation.valid {
            log::warn!(target: "eventvisor",
                       event_name,
                       errors:serde = validation.errors;
                       "event validation failed");
            return None;
        }
        let validated = validation.value.unwrap_or(Value::Null);

        let event_inputs = inputs([
            ("eventName", Some(Value::from(event_name))),
            ("eventLevel", Some(Value::from(event_level.as_str()))),
            ("payload", Some(validated.clone())),
        ]);

        if let Some(conditions) = &event.conditions {
            if !evaluator
                .conditions_checker()
                .all_are_matched(conditions, &event_inputs)
            {
                log::debug!(target: "eventvisor", event_name; "event conditions not matched");
                return None;
            }
        }

        if let Some(sample) = &event.sample {
            let result = evaluator.bucketer().is_sampled(sample.as_slice(), &event_inputs);
            if !result.is_sampled {
                log::debug!(target: "eventvisor",
                            event_name,
                            sample:serde = result;
                            "event not sampled");
                return None;
            }
        }

        let transformed = match &event.transforms {
            Some(transforms) => {
                evaluator
                    .transformer()
                    .apply_all(&validated, transforms, &event_inputs)
            }
            None => validated,
        };

        self.effects
            .dispatch(evaluator, EffectOnType::EventTracked, event_name, &transformed);

        for destination_name in reader.get_destination_names() {
            let Some(destination) = reader.get_destination(destination_name) else {
                continue;
            };
            if !self.modules.transport_exists(&destination.transport) {
                log::error!(target: "eventvisor",
                            event_name,
                            destination_name,
                            transport = destination.transport.as_str();
                            "destination has no transport");
                continue;
            }
            let Some(body) = self.destination_body(
                evaluator,
                event_name,
                event,
                (destination_name, destination),
                &transformed,
            ) else {
                continue;
            };
            self.modules.transport(
                &destination.transport,
                TransportOptions {
                    destination_name,
                    event_name,
                    event_level,
                    payload: &body,
                    error,
                },
            );
        }

        Some(transformed)
    }

    /// Body to hand over to a destination's transport, or `None` when the destination is skipped.
    ///
    /// The event's override for the destination runs first, then the destination's own rules.
    /// Both see the body as transformed so far.
    fn destination_body(
        &self,
        evaluator: Evaluator<'_>,
        event_name: &str,
        event: &Event,
        (destination_name, destination): (&str, &Destination),
        transformed: &Value,
    ) -> Option<Value> {
        let event_level = event.level.unwrap_or_default();
        let destination_inputs = |payload: &Value| -> Inputs {
            inputs([
                ("eventName", Some(Value::from(event_name))),
                ("eventLevel", Some(Value::from(event_level.as_str()))),
                ("payload", Some(payload.clone())),
                ("destinationName", Some(Value::from(destination_name))),
                ("attributes", Some(Value::Object(self.attributes.get_attributes()))),
            ])
        };

        let checker = evaluator.conditions_checker();
        let mut body = transformed.clone();

        let overrides = event
            .destinations
            .as_ref()
            .and_then(|destinations| destinations.get(destination_name));
        let rules = match overrides {
            Some(DestinationOverride::Enabled(false)) => {
                log::debug!(target: "eventvisor",
                            event_name,
                            destination_name;
                            "destination disabled for event");
                return None;
            }
            Some(DestinationOverride::Options(options)) => vec![
                (&options.conditions, &options.sample, &options.transforms),
                (&destination.conditions, &destination.sample, &destination.transforms),
            ],
            Some(DestinationOverride::Enabled(true)) | None => vec![(
                &destination.conditions,
                &destination.sample,
                &destination.transforms,
            )],
        };

        for (conditions, sample, transforms) in rules {
            if let Some(conditions) = conditions {
                if !checker.all_are_matched(conditions, &destination_inputs(&body)) {
                    log::debug!(target: "eventvisor",
                                event_name,
                                destination_name;
                                "destination conditions not matched");
                    return None;
                }
            }
            if let Some(sample) = sample {
                let result = evaluator
                    .bucketer()
                    .is_sampled(sample.as_slice(), &destination_inputs(&body));
                if !result.is_sampled {
                    log::debug!(target: "eventvisor",
                                event_name,
                                destination_name,
                                sample:serde = result;
                                "destination not sampled");
                    return None;
                }
            }
            if let Some(transforms) = transforms {
                let transform_inputs = destination_inputs(&body);
                body = evaluator
                    .transformer()
                    .apply_all(&body, transforms, &transform_inputs);
            }
        }

        Some(body)
    }
}

/// A running engine: one datafile revision at a time, its modules, attributes and effect states.
///
/// Mutating operations (`track`, `set_attribute`, `remove_attribute`) are queued and processed in
/// call order by a dedicated worker thread. Reads are served directly and reflect the last
/// completed write.
///
/// ```
/// # use eventvisor::{Datafile, InstanceConfig};
/// # use serde_json::json;
/// let datafile = Datafile::from_value(json!({
///     "revision": "1",
///     "attributes": {"userId": {"type": "string"}}
/// }))
/// .unwrap();
/// let instance = InstanceConfig::new()
///     .with_datafile(datafile)
///     .to_instance()
///     .unwrap();
///
/// instance.set_attribute("userId", json!("user-123")).wait().unwrap();
/// assert_eq!(instance.get_attribute_value("userId"), json!("user-123"));
/// ```
pub struct Instance {
    shared: Arc<Shared>,
    /// `None` only while dropping.
    queue: Option<mpsc::Sender<Action>>,
    worker: Option<JoinHandle<()>>,
}

impl Instance {
    pub fn new(config: InstanceConfig) -> Result<Instance> {
        let InstanceConfig { datafile, modules } = config;

        let emitter = Emitter::new();
        let shared = Arc::new(Shared {
            store: DatafileStore::new(datafile),
            modules: ModulesManager::new(),
            attributes: AttributesManager::new(emitter.clone()),
            effects: EffectsManager::new(),
            emitter,
            ready: (Mutex::new(false), Condvar::new()),
        });
        for module in modules {
            shared.modules.register_module(module);
        }

        let (queue, receiver) = mpsc::channel::<Action>();
        let worker = {
            // Cloning Arc for move into thread
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("eventvisor-worker".to_owned())
                .spawn(move || {
                    shared.initialize();
                    // Ends once the Instance drops its sender and the queue is drained.
                    for action in receiver {
                        shared.process(action);
                    }
                    log::debug!(target: "eventvisor", "worker thread stopped");
                })?
        };

        log::debug!(target: "eventvisor",
                    revision = shared.store.get_reader().get_revision();
                    "instance created");

        Ok(Instance {
            shared,
            queue: Some(queue),
            worker: Some(worker),
        })
    }

    fn enqueue<T>(&self, action: impl FnOnce(mpsc::Sender<T>) -> Action) -> Pending<T> {
        let (reply, receiver) = mpsc::channel();
        let sent = self
            .queue
            .as_ref()
            .is_some_and(|queue| queue.send(action(reply)).is_ok());
        if !sent {
            log::error!(target: "eventvisor", "worker thread is not running");
        }
        Pending { receiver }
    }

    /// Queue an event. The outcome is the payload after event-level transforms, or `None` if the
    /// event was dropped (unknown, invalid, filtered out or not sampled).
    pub fn track(&self, event_name: impl Into<String>, payload: Value) -> Pending<Option<Value>> {
        let event_name = event_name.into();
        self.enqueue(|reply| Action::Track {
            event_name,
            payload,
            error: None,
            reply,
        })
    }

    /// Queue an event whose payload is built from `error` (see [`error_to_value`]). Transports
    /// receive the error message in [`TransportOptions::error`].
    pub fn track_error(
        &self,
        event_name: impl Into<String>,
        error: &dyn std::error::Error,
        extra: Option<&Value>,
    ) -> Pending<Option<Value>> {
        let event_name = event_name.into();
        let payload = error_to_value(error, extra);
        let message = error.to_string();
        self.enqueue(|reply| Action::Track {
            event_name,
            payload,
            error: Some(message),
            reply,
        })
    }

    /// Queue an attribute update. The outcome is the stored value, or `None` if the value was
    /// rejected.
    pub fn set_attribute(
        &self,
        attribute_name: impl Into<String>,
        value: Value,
    ) -> Pending<Option<Value>> {
        let attribute_name = attribute_name.into();
        self.enqueue(|reply| Action::SetAttribute {
            attribute_name,
            value,
            reply,
        })
    }

    pub fn remove_attribute(&self, attribute_name: impl Into<String>) -> Pending<()> {
        let attribute_name = attribute_name.into();
        self.enqueue(|reply| Action::RemoveAttribute {
            attribute_name,
            reply,
        })
    }

    /// Block until every operation queued before this call has completed.
    pub fn flush(&self) -> Result<()> {
        self.enqueue(Action::Flush).wait()
    }

    pub fn is_ready(&self) -> bool {
        match self.shared.ready.0.lock() {
            Ok(ready) => *ready,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Block until attributes and effects are initialized from storage.
    pub fn on_ready(&self) -> Result<()> {
        let (lock, condvar) = &self.shared.ready;
        let mut ready = lock.lock().map_err(|_| Error::WorkerThreadPanicked)?;
        while !*ready {
            ready = condvar
                .wait(ready)
                .map_err(|_| Error::WorkerThreadPanicked)?;
        }
        Ok(())
    }

    /// Same as [`Instance::on_ready`] but gives up after `timeout`. Returns whether the instance
    /// is ready.
    pub fn on_ready_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &self.shared.ready;
        let Ok(ready) = lock.lock() else {
            return false;
        };
        condvar
            .wait_timeout_while(ready, timeout, |ready| !*ready)
            .is_ok_and(|(ready, _)| *ready)
    }

    pub fn get_revision(&self) -> String {
        self.shared.store.get_reader().get_revision().to_owned()
    }

    /// Install a new datafile. Operations already running keep using the previous one.
    ///
    /// Effects introduced by the new datafile get their initial state once the queue reaches
    /// this point.
    pub fn set_datafile(&self, datafile: Datafile) {
        let previous = self.shared.store.set_datafile(datafile);
        log::info!(target: "eventvisor",
                   previous_revision = previous.get_revision(),
                   revision = self.get_revision().as_str();
                   "datafile set");
        self.shared
            .emitter
            .trigger(EmitType::DatafileSet, &EventDetails::new());
        if let Some(queue) = &self.queue {
            let _ = queue.send(Action::RefreshEffects);
        }
    }

    pub fn register_module(&self, module: Module) {
        self.shared.modules.register_module(module);
    }

    pub fn remove_module(&self, module_name: &str) {
        self.shared.modules.remove_module(module_name);
    }

    /// Subscribe to lifecycle notifications.
    pub fn on(
        &self,
        emit_type: EmitType,
        callback: impl Fn(&EventDetails) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.emitter.on(emit_type, callback)
    }

    /// Current value of an attribute, `null` if not set.
    pub fn get_attribute_value(&self, attribute_name: &str) -> Value {
        self.shared.attributes.get_attribute_value(attribute_name)
    }

    pub fn is_attribute_set(&self, attribute_name: &str) -> bool {
        self.shared.attributes.is_attribute_set(attribute_name)
    }

    pub fn get_attributes(&self) -> serde_json::Map<String, Value> {
        self.shared.attributes.get_attributes()
    }

    pub fn get_state_value(&self, effect_name: &str) -> Option<Value> {
        self.shared.effects.get_state_value(effect_name)
    }

    pub fn get_all_states(&self) -> serde_json::Map<String, Value> {
        self.shared.effects.get_all_states()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish what is already queued and exit.
        drop(self.queue.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!(target: "eventvisor", "worker thread panicked");
            }
        }
    }
}
