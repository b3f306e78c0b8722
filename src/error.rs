use std::sync::Arc;

use crate::conditions::ConditionOperator;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur inside the engine.
///
/// Public engine operations never return these to the caller directly: they are logged and turned
/// into a `None`/no-op result. They surface only from constructors and from the lower-level
/// building blocks when used standalone.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Datafile could not be parsed.
    #[error("error parsing datafile")]
    DatafileParse(#[source] Arc<serde_json::Error>),

    /// A `matches`/`notMatches` condition or a schema `pattern` holds an invalid regex.
    #[error("invalid regex {pattern:?} (flags: {flags:?}): {message}")]
    InvalidRegex {
        pattern: String,
        flags: String,
        message: String,
    },

    /// Unsupported regex flag.
    #[error("invalid regex flag {0:?}")]
    InvalidRegexFlag(char),

    /// Version string could not be parsed by the semver comparator.
    #[error("invalid version string {0:?}")]
    InvalidVersion(String),

    /// Leaf condition is missing its `value`.
    #[error("condition with operator {0:?} requires a value")]
    MissingConditionValue(ConditionOperator),

    /// Module is not registered or does not implement the requested capability.
    #[error("module {module:?} not found with {capability:?} capability")]
    ModuleNotFound {
        module: String,
        capability: &'static str,
    },

    /// Module returned an error or panicked.
    #[error("module {module:?} failed in {capability:?}: {message}")]
    ModuleFailed {
        module: String,
        capability: &'static str,
        message: String,
    },

    /// Indicates that the worker thread panicked. This should normally never happen.
    #[error("instance worker thread panicked")]
    WorkerThreadPanicked,

    /// An I/O error, e.g. the worker thread could not be spawned.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::DatafileParse(Arc::new(value))
    }
}
