//! Eventvisor: a datafile-driven rules engine for tracked events.
//!
//! # Overview
//!
//! An [`Instance`] is configured with a [`Datafile`] declaring attributes, events, destinations and
//! effects. Every tracked event is validated against its schema, gated by conditions and
//! deterministic sampling, transformed, handed over to effects, and finally routed to
//! destinations through transport [`Module`]s.
//!
//! Modules are the only way the engine talks to the outside world: they provide lookups, effect
//! step handlers, transports and persistent storage for attributes and effect states.
//!
//! ```
//! # use std::sync::{Arc, Mutex};
//! # use eventvisor::{Datafile, InstanceConfig, Module};
//! # use serde_json::json;
//! let datafile = Datafile::from_value(json!({
//!     "revision": "1",
//!     "events": {
//!         "page_view": {
//!             "type": "object",
//!             "properties": {"url": {"type": "string"}},
//!             "required": ["url"]
//!         }
//!     },
//!     "destinations": {"console": {"transport": "console"}}
//! }))
//! .unwrap();
//!
//! let delivered = Arc::new(Mutex::new(Vec::new()));
//! let console = {
//!     let delivered = delivered.clone();
//!     Module::new("console").with_transport(move |options| {
//!         delivered.lock().unwrap().push(options.payload.clone());
//!         Ok(())
//!     })
//! };
//!
//! let instance = InstanceConfig::new()
//!     .with_datafile(datafile)
//!     .with_module(console)
//!     .to_instance()
//!     .unwrap();
//!
//! instance.track("page_view", json!({"url": "/"})).wait().unwrap();
//! // fails validation and is dropped
//! instance.track("page_view", json!({})).wait().unwrap();
//!
//! assert_eq!(*delivered.lock().unwrap(), vec![json!({"url": "/"})]);
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! The engine is not supposed to take the host application down: unknown events, invalid payloads
//! and misbehaving modules are logged and result in a `None` outcome or a no-op. Errors are only
//! returned when an instance cannot be created or a datafile cannot be parsed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with structured key-values, under the `eventvisor` target. Consider integrating a
//! `log`-compatible logger implementation for better visibility into engine operations.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/` directory of the `eventvisor` crate
//! repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
mod bucketer;
mod conditions;
mod config;
mod datafile;
mod datafile_reader;
mod datafile_store;
mod effects;
mod emitter;
mod error;
mod evaluator;
mod instance;
mod modules;
mod path;
mod persister;
mod source;
mod transformer;
mod validator;
mod value;
mod versions;

pub use attributes::AttributesManager;
pub use bucketer::{
    get_bucketed_number, murmurhash_v3, Bucketer, Sample, SampleBy, SampleResult,
    MAX_BUCKETED_NUMBER,
};
pub use conditions::{Condition, ConditionOperator, ConditionsChecker, PlainCondition};
pub use config::InstanceConfig;
pub use datafile::{
    Attribute, ComplexPersist, Datafile, Destination, DestinationOverride,
    DestinationOverrideOptions, Effect, EffectOn, EffectOnType, Event, EventLevel, JsonSchema,
    OneOrMany, Persist, SchemaItems, SchemaType, Step, TryParse,
};
pub use datafile_reader::DatafileReader;
pub use effects::EffectsManager;
pub use emitter::{EmitType, Emitter, EventDetails, Subscription};
pub use error::{Error, Result};
pub use evaluator::Evaluator;
pub use instance::{Instance, Pending};
pub use modules::{
    HandleOptions, LookupOptions, Module, ModuleError, ModuleResult, ModulesManager,
    ReadFromStorageOptions, RemoveFromStorageOptions, TransportOptions, WriteToStorageOptions,
};
pub use path::{Path, PathSegment};
pub use source::{Origin, SourceDescriptor, SourceResolver};
pub use transformer::{Transform, TransformType, Transformer};
pub use validator::{error_to_value, ValidationError, ValidationResult, Validator};
pub use value::{Inputs, Value};
pub use versions::compare_versions;
