//! Pluggable capability providers.
//!
//! A [`Module`] is identified by its name and implements any subset of the capabilities (lookup,
//! handle, transport and storage). Datafiles address module capabilities as
//! `"<moduleName>[.<key>]"`.
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
};

use serde::Serialize;

use crate::{
    datafile::{Effect, EventLevel, Step},
    value::Value,
    Error, Result,
};

/// Error returned by module capabilities.
pub type ModuleError = Box<dyn std::error::Error + Send + Sync>;

pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LookupOptions<'a> {
    /// Address with the module name stripped: `"env.stage"` is looked up as `"stage"`.
    pub key: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleOptions<'a> {
    pub effect_name: &'a str,
    pub effect: &'a Effect,
    pub step: &'a Step,
    pub payload: &'a Value,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions<'a> {
    pub destination_name: &'a str,
    pub event_name: &'a str,
    pub event_level: EventLevel,
    pub payload: &'a Value,
    /// Message of the error passed to `track_error`, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReadFromStorageOptions<'a> {
    pub key: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WriteToStorageOptions<'a> {
    pub key: &'a str,
    pub value: &'a Value,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RemoveFromStorageOptions<'a> {
    pub key: &'a str,
}

type LookupFn = Box<dyn Fn(LookupOptions<'_>) -> ModuleResult<Value> + Send + Sync>;
type HandleFn = Box<dyn Fn(HandleOptions<'_>) -> ModuleResult<()> + Send + Sync>;
type TransportFn = Box<dyn Fn(TransportOptions<'_>) -> ModuleResult<()> + Send + Sync>;
type ReadFromStorageFn =
    Box<dyn Fn(ReadFromStorageOptions<'_>) -> ModuleResult<Option<Value>> + Send + Sync>;
type WriteToStorageFn = Box<dyn Fn(WriteToStorageOptions<'_>) -> ModuleResult<()> + Send + Sync>;
type RemoveFromStorageFn =
    Box<dyn Fn(RemoveFromStorageOptions<'_>) -> ModuleResult<()> + Send + Sync>;

/// Named set of optional capabilities.
///
/// ```
/// # use eventvisor::Module;
/// let console = Module::new("console").with_transport(|options| {
///     println!("{}: {}", options.destination_name, options.payload);
///     Ok(())
/// });
/// assert_eq!(console.name(), "console");
/// ```
pub struct Module {
    name: String,
    lookup: Option<LookupFn>,
    handle: Option<HandleFn>,
    transport: Option<TransportFn>,
    read_from_storage: Option<ReadFromStorageFn>,
    write_to_storage: Option<WriteToStorageFn>,
    remove_from_storage: Option<RemoveFromStorageFn>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Module {
        Module {
            name: name.into(),
            lookup: None,
            handle: None,
            transport: None,
            read_from_storage: None,
            write_to_storage: None,
            remove_from_storage: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_lookup(
        mut self,
        f: impl Fn(LookupOptions<'_>) -> ModuleResult<Value> + Send + Sync + 'static,
    ) -> Module {
        self.lookup = Some(Box::new(f));
        self
    }

    /// Handler for effect steps.
    pub fn with_handle(
        mut self,
        f: impl Fn(HandleOptions<'_>) -> ModuleResult<()> + Send + Sync + 'static,
    ) -> Module {
        self.handle = Some(Box::new(f));
        self
    }

    pub fn with_transport(
        mut self,
        f: impl Fn(TransportOptions<'_>) -> ModuleResult<()> + Send + Sync + 'static,
    ) -> Module {
        self.transport = Some(Box::new(f));
        self
    }

    /// Storage read. Return `Ok(None)` when nothing is stored under the key.
    pub fn with_read_from_storage(
        mut self,
        f: impl Fn(ReadFromStorageOptions<'_>) -> ModuleResult<Option<Value>> + Send + Sync + 'static,
    ) -> Module {
        self.read_from_storage = Some(Box::new(f));
        self
    }

    pub fn with_write_to_storage(
        mut self,
        f: impl Fn(WriteToStorageOptions<'_>) -> ModuleResult<()> + Send + Sync + 'static,
    ) -> Module {
        self.write_to_storage = Some(Box::new(f));
        self
    }

    pub fn with_remove_from_storage(
        mut self,
        f: impl Fn(RemoveFromStorageOptions<'_>) -> ModuleResult<()> + Send + Sync + 'static,
    ) -> Module {
        self.remove_from_storage = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("lookup", &self.lookup.is_some())
            .field("handle", &self.handle.is_some())
            .field("transport", &self.transport.is_some())
            .field("read_from_storage", &self.read_from_storage.is_some())
            .field("write_to_storage", &self.write_to_storage.is_some())
            .field("remove_from_storage", &self.remove_from_storage.is_some())
            .finish()
    }
}

/// Split `"<moduleName>.<key>"` on the first dot.
fn split_address(address: &str) -> (&str, &str) {
    address.split_once('.').unwrap_or((address, ""))
}

/// Registry of modules, in registration order.
///
/// Module failures (errors and panics) never escape the manager: reads degrade to `null`/`None`
/// and writes to a no-op, with an error logged.
pub struct ModulesManager {
    modules: RwLock<Vec<Arc<Module>>>,
}

impl Default for ModulesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulesManager {
    pub fn new() -> ModulesManager {
        ModulesManager {
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Register a module. A module with the same name as an already registered one is ignored.
    pub fn register_module(&self, module: Module) {
        let Ok(mut modules) = self.modules.write() else {
            return;
        };
        if modules.iter().any(|m| m.name == module.name) {
            log::error!(target: "eventvisor",
                        module_name = module.name.as_str();
                        "module already registered");
            return;
        }
        log::debug!(target: "eventvisor", module_name = module.name.as_str(); "module registered");
        modules.push(Arc::new(module));
    }

    pub fn remove_module(&self, module_name: &str) {
        let Ok(mut modules) = self.modules.write() else {
            return;
        };
        let before = modules.len();
        modules.retain(|m| m.name != module_name);
        if modules.len() == before {
            log::error!(target: "eventvisor", module_name; "module not found");
        }
    }

    fn get_module(&self, module_name: &str) -> Option<Arc<Module>> {
        // Cloning the Arc so that the lock is not held while the module runs. Modules may call
        // back into the instance.
        let modules = self.modules.read().ok()?;
        modules.iter().find(|m| m.name == module_name).cloned()
    }

    /// Run `f` against the named module, turning a missing capability, an error or a panic into
    /// an [`Error`].
    fn call<T>(
        &self,
        module_name: &str,
        capability: &'static str,
        f: impl FnOnce(&Module) -> Option<ModuleResult<T>>,
    ) -> Result<T> {
        let not_found = || Error::ModuleNotFound {
            module: module_name.to_owned(),
            capability,
        };
        let failed = |message: String| Error::ModuleFailed {
            module: module_name.to_owned(),
            capability,
            message,
        };

        let module = self.get_module(module_name).ok_or_else(not_found)?;
        match catch_unwind(AssertUnwindSafe(|| f(module.as_ref()))) {
            Ok(Some(Ok(value))) => Ok(value),
            Ok(Some(Err(err))) => Err(failed(err.to_string())),
            Ok(None) => Err(not_found()),
            Err(_) => Err(failed("module panicked".to_owned())),
        }
    }

    /// Resolve a `"<moduleName>.<key>"` lookup. Returns `null` on any failure.
    pub fn lookup(&self, address: &str) -> Value {
        let (module_name, key) = split_address(address);
        let result = self.call(module_name, "lookup", |module| {
            let lookup = module.lookup.as_ref()?;
            Some(lookup(LookupOptions { key }))
        });
        result.unwrap_or_else(|err| {
            log::error!(target: "eventvisor", module_name, key; "lookup failed: {err}");
            Value::Null
        })
    }

    /// Run an effect step handler. Errors are logged and returned so that the caller can decide
    /// whether to go on with the effect.
    pub fn handle(
        &self,
        address: &str,
        effect_name: &str,
        effect: &Effect,
        step: &Step,
        payload: &Value,
    ) -> Result<()> {
        let (module_name, _) = split_address(address);
        let options = HandleOptions {
            effect_name,
            effect,
            step,
            payload,
        };
        let result = self.call(module_name, "handle", |module| {
            let handle = module.handle.as_ref()?;
            Some(handle(options))
        });
        if let Err(err) = &result {
            log::error!(target: "eventvisor", module_name, effect_name; "handle failed: {err}");
        }
        result
    }

    pub fn transport_exists(&self, address: &str) -> bool {
        let (module_name, _) = split_address(address);
        self.get_module(module_name)
            .is_some_and(|module| module.transport.is_some())
    }

    pub fn transport(&self, address: &str, options: TransportOptions<'_>) {
        let (module_name, _) = split_address(address);
        let result = self.call(module_name, "transport", |module| {
            let transport = module.transport.as_ref()?;
            Some(transport(options))
        });
        if let Err(err) = result {
            log::error!(target: "eventvisor",
                        module_name,
                        destination_name = options.destination_name,
                        event_name = options.event_name;
                        "transport failed: {err}");
        }
    }

    /// Read from a storage module. `null` values are reported as `None`.
    pub fn read_from_storage(&self, module_name: &str, key: &str) -> Option<Value> {
        let result = self.call(module_name, "read_from_storage", |module| {
            let read = module.read_from_storage.as_ref()?;
            Some(read(ReadFromStorageOptions { key }))
        });
        match result {
            Ok(value) => value.filter(|value| !value.is_null()),
            Err(err) => {
                log::error!(target: "eventvisor", module_name, key; "read from storage failed: {err}");
                None
            }
        }
    }

    pub fn write_to_storage(&self, module_name: &str, key: &str, value: &Value) {
        let result = self.call(module_name, "write_to_storage", |module| {
            let write = module.write_to_storage.as_ref()?;
            Some(write(WriteToStorageOptions { key, value }))
        });
        if let Err(err) = result {
            log::error!(target: "eventvisor", module_name, key; "write to storage failed: {err}");
        }
    }

    pub fn remove_from_storage(&self, module_name: &str, key: &str) {
        let result = self.call(module_name, "remove_from_storage", |module| {
            let remove = module.remove_from_storage.as_ref()?;
            Some(remove(RemoveFromStorageOptions { key }))
        });
        if let Err(err) = result {
            log::error!(target: "eventvisor", module_name, key; "remove from storage failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use serde_json::json;

    use crate::{
        datafile::{Effect, EventLevel, Step},
        Error,
    };

    use super::{Module, ModulesManager, TransportOptions};

    #[test]
    fn duplicate_registration_keeps_the_first_module() {
        let modules = ModulesManager::new();
        modules.register_module(Module::new("env").with_lookup(|_| Ok(json!("first"))));
        modules.register_module(Module::new("env").with_lookup(|_| Ok(json!("second"))));

        assert_eq!(modules.lookup("env.anything"), json!("first"));
    }

    #[test]
    fn lookup_strips_the_module_name() {
        let modules = ModulesManager::new();
        modules.register_module(
            Module::new("env").with_lookup(|options| Ok(json!(options.key.to_owned()))),
        );

        assert_eq!(modules.lookup("env.a.b"), json!("a.b"));
        assert_eq!(modules.lookup("env"), json!(""));
        assert_eq!(modules.lookup("missing.a"), json!(null));
    }

    #[test]
    fn failures_degrade_to_defaults() {
        let modules = ModulesManager::new();
        modules.register_module(
            Module::new("broken")
                .with_lookup(|_| Err("boom".into()))
                .with_read_from_storage(|_| panic!("storage exploded"))
                .with_transport(|_| Err("unreachable".into())),
        );

        assert_eq!(modules.lookup("broken.key"), json!(null));
        assert_eq!(modules.read_from_storage("broken", "key"), None);
        // no panic escapes
        modules.transport(
            "broken",
            TransportOptions {
                destination_name: "d",
                event_name: "e",
                event_level: EventLevel::Info,
                payload: &json!({}),
                error: None,
            },
        );
    }

    #[test]
    fn handle_reports_errors() {
        let modules = ModulesManager::new();
        modules.register_module(Module::new("ok").with_handle(|_| Ok(())));
        modules.register_module(Module::new("failing").with_handle(|_| Err("nope".into())));
        let effect: Effect = serde_json::from_value(json!({"steps": []})).unwrap();
        let step: Step = serde_json::from_value(json!({"handler": "ok"})).unwrap();

        assert!(modules.handle("ok.run", "e", &effect, &step, &json!(null)).is_ok());
        assert!(matches!(
            modules.handle("failing", "e", &effect, &step, &json!(null)),
            Err(Error::ModuleFailed { .. })
        ));
        assert!(matches!(
            modules.handle("missing", "e", &effect, &step, &json!(null)),
            Err(Error::ModuleNotFound {
                capability: "handle",
                ..
            })
        ));
    }

    #[test]
    fn storage_round_trip() {
        let store = Arc::new(Mutex::new(HashMap::new()));
        let module = {
            let (read, write, remove) = (store.clone(), store.clone(), store.clone());
            Module::new("memory")
                .with_read_from_storage(move |options| {
                    Ok(read.lock().unwrap().get(options.key).cloned())
                })
                .with_write_to_storage(move |options| {
                    write
                        .lock()
                        .unwrap()
                        .insert(options.key.to_owned(), options.value.clone());
                    Ok(())
                })
                .with_remove_from_storage(move |options| {
                    remove.lock().unwrap().remove(options.key);
                    Ok(())
                })
        };
        let modules = ModulesManager::new();
        modules.register_module(module);

        modules.write_to_storage("memory", "attributes_userId", &json!("u1"));
        assert_eq!(
            modules.read_from_storage("memory", "attributes_userId"),
            Some(json!("u1"))
        );
        modules.remove_from_storage("memory", "attributes_userId");
        assert_eq!(modules.read_from_storage("memory", "attributes_userId"), None);
    }

    #[test]
    fn capability_discovery() {
        let modules = ModulesManager::new();
        modules.register_module(Module::new("console").with_transport(|_| Ok(())));
        modules.register_module(Module::new("env").with_lookup(|_| Ok(json!(1))));

        assert!(modules.transport_exists("console"));
        assert!(modules.transport_exists("console.debug"));
        assert!(!modules.transport_exists("env"));
        assert!(!modules.transport_exists("missing"));

        modules.remove_module("console");
        assert!(!modules.transport_exists("console"));
    }
}
