//! Configuration file structures for the extension engine CLI.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ModuleEntry`]: Extension module to load into every engine
//! - [`InvocationEntry`]: Extension call to perform
//! - [`SeedEntry`]: Item written to the state store before invocations

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// app = "test1/app1"
/// num_engines = 2
///
/// [runtime.extension]
/// memory_limit_pages = 32
///
/// [runtime.limits]
/// execution_interval_ms = 100
///
/// [[modules]]
/// path = "github.com/company/orders"
/// url = "file:///var/lib/ext/orders.wasm"
/// extensions = ["CalcOrderedItems"]
///
/// [[invocations]]
/// package = "github.com/company/orders"
/// extension = "CalcOrderedItems"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Application name used in logs and metric labels.
    #[serde(default = "defaults::app")]
    pub app: String,

    /// Name of the hosting VM used as a metric label.
    #[serde(default = "defaults::vvm_name")]
    pub vvm_name: String,

    /// Number of independent engines to create.
    #[serde(default = "defaults::num_engines")]
    pub num_engines: usize,

    /// Runtime configuration (engine, extension, limits).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Modules to load into every engine.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,

    /// Items to write into the state store before running invocations.
    #[serde(default)]
    pub seed: Vec<SeedEntry>,

    /// Extension calls to perform, in order.
    #[serde(default)]
    pub invocations: Vec<InvocationEntry>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app: defaults::app(),
            vvm_name: defaults::vvm_name(),
            num_engines: defaults::num_engines(),
            runtime: RuntimeConfig::default(),
            modules: Vec::new(),
            seed: Vec::new(),
            invocations: Vec::new(),
        }
    }
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// An extension module loaded into every engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Package path the module's extensions are addressed by.
    pub path: String,

    /// Location of the WebAssembly binary (`file://` only).
    pub url: String,

    /// Extension entry points exported by the module.
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// A single extension call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvocationEntry {
    /// Package path of the module.
    pub package: String,

    /// Extension entry point name.
    pub extension: String,

    /// Index of the engine to run on.
    #[serde(default)]
    pub engine: usize,
}

/// An item written into the state store before invocations run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeedEntry {
    /// Storage qualified name, e.g. `sys.View`.
    pub storage: String,

    /// Entity full qualified name, empty for storages without entities.
    #[serde(default)]
    pub entity: String,

    /// Key fields.
    #[serde(default)]
    pub key: toml::Table,

    /// Value fields.
    #[serde(default)]
    pub value: toml::Table,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn app() -> String {
        "untitled/app".to_string()
    }

    pub fn vvm_name() -> String {
        "local".to_string()
    }

    pub const fn num_engines() -> usize {
        1
    }
}
