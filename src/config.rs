use crate::{datafile::Datafile, modules::Module, Instance, Result};

/// Configuration for [`Instance`].
pub struct InstanceConfig {
    pub(crate) datafile: Datafile,
    pub(crate) modules: Vec<Module>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceConfig {
    /// Create a configuration with an empty datafile and no modules.
    ///
    /// ```
    /// # use eventvisor::InstanceConfig;
    /// InstanceConfig::new();
    /// ```
    pub fn new() -> Self {
        InstanceConfig {
            datafile: Datafile::empty(),
            modules: Vec::new(),
        }
    }

    pub fn with_datafile(mut self, datafile: Datafile) -> Self {
        self.datafile = datafile;
        self
    }

    /// Register a module on the new instance.
    ///
    /// ```
    /// # use eventvisor::{InstanceConfig, Module};
    /// let config = InstanceConfig::new().with_module(Module::new("console").with_transport(
    ///     |options| {
    ///         println!("{} {}", options.event_name, options.payload);
    ///         Ok(())
    ///     },
    /// ));
    /// ```
    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_modules(mut self, modules: impl IntoIterator<Item = Module>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Create a new [`Instance`] using the specified configuration.
    ///
    /// Fails only if the worker thread cannot be spawned.
    pub fn to_instance(self) -> Result<Instance> {
        Instance::new(self)
    }
}
